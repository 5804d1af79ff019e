//! Completion service access: HTTP client, model parameter shapes, structured
//! output recovery and stage prompts.

pub mod client;
pub mod models;
pub mod parse;
pub mod prompts;

pub use client::{
    ChatMessage, CompletionClient, CompletionError, CompletionFuture, CompletionRequest,
    CompletionResponse, CompletionService, RetryPolicy, Role,
};
pub use models::{merge_usage, ModelFamily, Usage};
pub use parse::{extract_json, ExtractError, Extracted, Strategy};
