//! Message types for the two wire dialects.
//!
//! The OpenAI-shaped types double as the internal normalized representation:
//! every request is converted into them before the policy runs, and every
//! backend response is converted back out of them.

pub mod anthropic;
pub mod openai;
