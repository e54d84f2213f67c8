//! Configuration for chat requests.
//!
//! A [`ChatConfig`] is built once at process startup and handed to the
//! streaming client; nothing in the engine reads configuration from ambient
//! globals.

/// Default model name.
const DEFAULT_MODEL: &str = "deepseek-chat";

/// Default sampling temperature.
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default maximum tokens per response.
const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Default outbound context budget, in characters of message content.
///
/// Roughly 12k tokens; oldest messages are dropped from the request payload
/// once a conversation exceeds this. The stored transcript is never touched.
const DEFAULT_CONTEXT_BUDGET: usize = 48_000;

/// Configuration for requests issued by the streaming client.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// The model to use for generating responses.
    pub model: String,

    /// Optional system prompt prepended to every request.
    pub system_prompt: Option<String>,

    /// Sampling temperature.
    pub temperature: f32,

    /// Maximum tokens per response.
    pub max_tokens: u32,

    /// Character budget for the outbound message history.
    pub context_budget: usize,
}

impl ChatConfig {
    /// Creates a configuration with the stock deepseek-chat defaults.
    pub fn new() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            context_budget: DEFAULT_CONTEXT_BUDGET,
        }
    }

    /// Sets the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the maximum tokens per response.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the outbound context budget in characters.
    pub fn with_context_budget(mut self, context_budget: usize) -> Self {
        self.context_budget = context_budget;
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}
