//! The coaching conversation engine: per-turn pipeline, prompt builders,
//! reflection synthesis, and the session-level service.

pub mod prompts;
pub mod reflection;
pub mod service;
pub mod turn;
