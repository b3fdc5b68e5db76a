pub(crate) mod llm;
pub(crate) mod token_counter;

pub(crate) use llm::{CompletionRequest, LlmClient, LlmConfig};
pub(crate) use token_counter::TokenCounter;
