#![forbid(unsafe_code)]

/// One chat message in provider order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Common response shape across model providers.
#[derive(Clone, Debug, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug)]
pub struct ProviderError(pub String);

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ProviderError {}

/// The model-provider capability. HTTP clients live outside this
/// repository; the in-tree implementation is the scripted double.
pub trait ModelProvider {
    fn chat_completion(&mut self, messages: &[Message])
        -> Result<CompletionResponse, ProviderError>;
}
