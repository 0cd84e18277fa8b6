pub mod llm;

pub use llm::{
    collect_stream, complete_prompt, provider_from_settings, stream_prompt, AnthropicProvider,
    LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole, MockProvider,
    OpenAiProvider, TextStream,
};
