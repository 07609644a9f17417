use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde_json::{Map, Value};
use snafu::Snafu;

use crate::config::SessionConfig;
use crate::message::Message;

/// Connection settings for one backend call.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl From<&SessionConfig> for ProviderConfig {
    fn from(config: &SessionConfig) -> Self {
        Self::new(&config.api_key, &config.endpoint)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    /// Conversation turns, oldest first. The last entry is the prompt being answered.
    pub messages: Vec<Message>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    /// Additional body fields merged into the outbound request.
    pub extra_fields: Map<String, Value>,
}

impl StreamRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            extra_fields: Map::new(),
        }
    }

    /// Builds the request for one turn from a config snapshot and the history
    /// snapshot that already ends with the new user message.
    pub fn from_config(config: &SessionConfig, history: Vec<Message>) -> Self {
        Self::new(config.model_name.clone(), history)
            .with_preamble(config.effective_system_prompt())
            .with_temperature(config.generation_params.temperature)
            .with_extra_fields(config.request_fields())
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_extra_fields(mut self, extra_fields: Map<String, Value>) -> Self {
        self.extra_fields = extra_fields;
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Incremental content fragments in the order the backend produced them.
///
/// Dropping the stream must release the underlying connection.
pub type FragmentStream = Pin<Box<dyn Stream<Item = ProviderResult<String>> + Send + 'static>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for endpoint '{endpoint}'"))]
    MissingApiKey {
        stage: &'static str,
        endpoint: String,
    },
    #[snafu(display("stream request for model '{model_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("backend failed on `{stage}`: {message}"))]
    Backend {
        stage: &'static str,
        message: String,
    },
}

/// Seam between streaming sessions and a concrete chat-completion backend.
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;

    /// Issues one streaming request and resolves once the response stream is open.
    fn open_stream(
        &self,
        provider: ProviderConfig,
        request: StreamRequest,
    ) -> BoxFuture<'static, ProviderResult<FragmentStream>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{CustomValue, DEFAULT_SYSTEM_PROMPT};

    #[test]
    fn from_config_carries_generation_and_custom_fields() {
        let mut config = SessionConfig::default();
        config
            .custom_params
            .insert("top_k", CustomValue::Integer(20));
        config
            .custom_params
            .insert("top_p", CustomValue::Float(0.8));

        let request = StreamRequest::from_config(&config, vec![Message::user("先輩")]);

        assert_eq!(request.model_id, "default");
        assert_eq!(request.preamble.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
        assert_eq!(request.temperature, Some(0.5));
        assert_eq!(request.extra_fields.get("max_tokens"), Some(&json!(300)));
        assert_eq!(request.extra_fields.get("top_k"), Some(&json!(20)));
        assert_eq!(request.extra_fields.get("top_p"), Some(&json!(0.8)));
        assert_eq!(request.extra_fields.get("presence_penalty"), Some(&json!(0.0)));
    }

    #[test]
    fn blank_system_prompt_falls_back_to_the_default() {
        let config = SessionConfig {
            system_prompt: "   ".to_string(),
            ..SessionConfig::default()
        };

        let request = StreamRequest::from_config(&config, vec![Message::user("hi")]);

        assert_eq!(request.preamble.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
    }

    #[test]
    fn provider_config_trims_and_redacts() {
        let provider = ProviderConfig::new("  sk-secret ", " http://localhost:8080/v1 ");

        assert_eq!(provider.api_key, "sk-secret");
        assert_eq!(provider.endpoint, "http://localhost:8080/v1");
        assert!(!format!("{provider:?}").contains("sk-secret"));
    }
}
