//! Single-shot question generation used when the streaming channel is not.

pub mod client;
pub mod gemini;

pub use client::{MockQuestionGenerator, QaPair, QuestionGenerator};
pub use gemini::GeminiQuestionClient;
