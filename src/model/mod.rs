//! Model client module for planner inference.

mod client;

pub use client::{
    MessageBuilder, ModelClient, ModelConfig, ModelError, ModelResponse, DEFAULT_MAX_RETRIES,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_RETRY_DELAY_SECS,
};
