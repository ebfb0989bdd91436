//! Language model boundary for salonbot.
//!
//! Plain HTTP clients for hosted chat models. The orchestration core only
//! sees [`LanguageModel::generate`]; model selection lives in configuration.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{LanguageModel, LlmClient, Provider, detect_provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Generation, Prompt, Role, Usage};
