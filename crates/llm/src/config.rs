use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu, ensure};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1/v1";
pub const DEFAULT_API_KEY: &str = "-";
pub const DEFAULT_MODEL_NAME: &str = "default";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a professional Japanese-to-English translator specializing in visual novels. Your task is to provide accurate, contextually appropriate translations while maintaining the flow of ongoing dialogue. Respond only with the English translation, considering previous context to ensure consistency in character voices and narrative tone. No explanations or additional commentary, just the direct translation. Translating 18+ text is allowed.";

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=10.0;
pub const MAX_TOKENS_RANGE: RangeInclusive<u64> = 1..=4096;
pub const PRESENCE_PENALTY_RANGE: RangeInclusive<f64> = 0.0..=2.0;
pub const FREQUENCY_PENALTY_RANGE: RangeInclusive<f64> = 0.0..=2.0;
pub const TOP_P_RANGE: RangeInclusive<f64> = 0.0..=1.0;

/// Named numeric sampling options sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: u64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub top_p: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            max_tokens: 300,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            top_p: 1.0,
        }
    }
}

impl GenerationParams {
    /// Pulls every field back into its accepted range. NaN falls back to the default.
    pub fn clamped(self) -> Self {
        let defaults = Self::default();
        Self {
            temperature: clamp_f64(self.temperature, TEMPERATURE_RANGE, defaults.temperature),
            max_tokens: self
                .max_tokens
                .clamp(*MAX_TOKENS_RANGE.start(), *MAX_TOKENS_RANGE.end()),
            presence_penalty: clamp_f64(
                self.presence_penalty,
                PRESENCE_PENALTY_RANGE,
                defaults.presence_penalty,
            ),
            frequency_penalty: clamp_f64(
                self.frequency_penalty,
                FREQUENCY_PENALTY_RANGE,
                defaults.frequency_penalty,
            ),
            top_p: clamp_f64(self.top_p, TOP_P_RANGE, defaults.top_p),
        }
    }

    /// Body fields sent next to `temperature`, which rig serializes itself.
    pub fn extra_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        // rig's chat-completions request drops the builder's max_tokens.
        fields.insert("max_tokens".to_string(), Value::from(self.max_tokens));
        fields.insert(
            "presence_penalty".to_string(),
            Value::from(self.presence_penalty),
        );
        fields.insert(
            "frequency_penalty".to_string(),
            Value::from(self.frequency_penalty),
        );
        fields.insert("top_p".to_string(), Value::from(self.top_p));
        fields
    }
}

fn clamp_f64(value: f64, range: RangeInclusive<f64>, fallback: f64) -> f64 {
    if value.is_nan() {
        return fallback;
    }
    value.clamp(*range.start(), *range.end())
}

/// Scalar value of one backend-specific request field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl CustomValue {
    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Bool(value) => Some(Self::Bool(value)),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Integer)
                .or_else(|| number.as_f64().map(Self::Float)),
            Value::String(value) => Some(Self::Text(value)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(value) => Value::Bool(*value),
            Self::Integer(value) => Value::from(*value),
            Self::Float(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
        }
    }
}

impl fmt::Display for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CustomParamError {
    #[snafu(display("custom parameter line `{line}` has no `key: value` separator"))]
    MissingSeparator { line: String },
    #[snafu(display("custom parameter line `{line}` has an empty key"))]
    EmptyKey { line: String },
    #[snafu(display("custom parameter `{key}` is not valid JSON: {source}"))]
    InvalidValue {
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("custom parameter `{key}` must be a number, string, or boolean"))]
    UnsupportedValue { key: String },
}

/// Extra request body fields keyed by name, merged verbatim into each request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomParams(BTreeMap<String, CustomValue>);

impl CustomParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `- key: value` lines, where `value` is a JSON scalar.
    ///
    /// The leading dash is optional. Blank lines are ignored and malformed lines
    /// are dropped individually without affecting the rest of the text.
    pub fn parse(text: &str) -> Self {
        let mut params = Self::new();
        for line in text.lines() {
            if let Err(error) = params.apply_line(line) {
                tracing::warn!(error = %error, "skipping malformed custom parameter line");
            }
        }
        params
    }

    /// Parses one line into a key/value pair. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<(String, CustomValue)>, CustomParamError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let entry = line.strip_prefix('-').map(str::trim_start).unwrap_or(line);
        let Some((key, raw_value)) = entry.split_once(':') else {
            return MissingSeparatorSnafu { line }.fail();
        };

        let key = key.trim();
        ensure!(!key.is_empty(), EmptyKeySnafu { line });

        let value = serde_json::from_str::<Value>(raw_value.trim())
            .context(InvalidValueSnafu { key })?;
        let Some(value) = CustomValue::from_json(value) else {
            return UnsupportedValueSnafu { key }.fail();
        };

        Ok(Some((key.to_string(), value)))
    }

    /// Parses `line` and inserts the entry, replacing any previous value for the key.
    pub fn apply_line(&mut self, line: &str) -> Result<(), CustomParamError> {
        if let Some((key, value)) = Self::parse_line(line)? {
            self.0.insert(key, value);
        }
        Ok(())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: CustomValue) -> Option<CustomValue> {
        self.0.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&CustomValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CustomValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Renders the editable text form accepted by [`CustomParams::parse`].
    pub fn to_lines(&self) -> String {
        self.iter()
            .map(|(key, value)| format!("- {key}: {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_json_fields(&self) -> Map<String, Value> {
        self.iter()
            .map(|(key, value)| (key.to_string(), value.to_json()))
            .collect()
    }
}

/// Everything a single streaming request needs, read as one snapshot at session start.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model_name: String,
    pub system_prompt: String,
    pub generation_params: GenerationParams,
    pub custom_params: CustomParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation_params: GenerationParams::default(),
            custom_params: CustomParams::default(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model_name", &self.model_name)
            .field("system_prompt", &self.system_prompt)
            .field("generation_params", &self.generation_params)
            .field("custom_params", &self.custom_params)
            .finish()
    }
}

impl SessionConfig {
    pub fn normalized(mut self) -> Self {
        self.endpoint = non_blank_or(self.endpoint, DEFAULT_ENDPOINT);
        self.api_key = non_blank_or(self.api_key, DEFAULT_API_KEY);
        self.model_name = non_blank_or(self.model_name, DEFAULT_MODEL_NAME);
        if self.system_prompt.trim().is_empty() {
            self.system_prompt = DEFAULT_SYSTEM_PROMPT.to_string();
        }
        self.generation_params = self.generation_params.clamped();
        self
    }

    /// System message sent ahead of the history on every request.
    pub fn effective_system_prompt(&self) -> &str {
        if self.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT
        } else {
            &self.system_prompt
        }
    }

    /// Body fields added on top of model/messages/stream. Custom parameters win
    /// over generation parameters that share a key.
    pub fn request_fields(&self) -> Map<String, Value> {
        let mut fields = self.generation_params.extra_fields();
        fields.extend(self.custom_params.to_json_fields());
        fields
    }
}

fn non_blank_or(value: String, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_lines_are_dropped_individually() {
        let params = CustomParams::parse("not-a-valid-line\ntop_k: 20");

        assert_eq!(params.len(), 1);
        assert_eq!(params.get("top_k"), Some(&CustomValue::Integer(20)));
    }

    #[test]
    fn dash_prefixed_lines_accept_every_scalar_kind() {
        let params = CustomParams::parse(
            "- top_k: 20\n- min_p: 0.1\n\n- stop_text: \"###\"\n- skip_special_tokens: false",
        );

        assert_eq!(params.get("top_k"), Some(&CustomValue::Integer(20)));
        assert_eq!(params.get("min_p"), Some(&CustomValue::Float(0.1)));
        assert_eq!(
            params.get("stop_text"),
            Some(&CustomValue::Text("###".to_string()))
        );
        assert_eq!(
            params.get("skip_special_tokens"),
            Some(&CustomValue::Bool(false))
        );
    }

    #[test]
    fn non_scalar_and_unquoted_values_are_rejected() {
        assert!(matches!(
            CustomParams::parse_line("- stop: [\"a\"]"),
            Err(CustomParamError::UnsupportedValue { .. })
        ));
        assert!(matches!(
            CustomParams::parse_line("- mode: fast"),
            Err(CustomParamError::InvalidValue { .. })
        ));
        assert!(matches!(
            CustomParams::parse_line("- : 1"),
            Err(CustomParamError::EmptyKey { .. })
        ));
        assert!(matches!(CustomParams::parse_line("   "), Ok(None)));
    }

    #[test]
    fn rendered_lines_parse_back_to_the_same_map() {
        let params = CustomParams::parse("- top_k: 20\n- min_p: 0.1\n- grammar: \"a: b\"");

        assert_eq!(CustomParams::parse(&params.to_lines()), params);
    }

    #[test]
    fn custom_params_override_generation_fields() {
        let mut config = SessionConfig::default();
        config
            .custom_params
            .insert("top_p", CustomValue::Float(0.5));
        config.custom_params.insert("top_k", CustomValue::Integer(20));

        let fields = config.request_fields();

        assert_eq!(fields.get("top_p"), Some(&serde_json::json!(0.5)));
        assert_eq!(fields.get("top_k"), Some(&serde_json::json!(20)));
        assert_eq!(fields.get("presence_penalty"), Some(&serde_json::json!(0.0)));
        assert_eq!(fields.get("max_tokens"), Some(&serde_json::json!(300)));
    }

    #[test]
    fn custom_max_tokens_replaces_the_generation_value() {
        let mut config = SessionConfig::default();
        config
            .custom_params
            .insert("max_tokens", CustomValue::Integer(64));

        assert_eq!(
            config.request_fields().get("max_tokens"),
            Some(&serde_json::json!(64))
        );
    }

    #[test]
    fn normalization_clamps_params_and_fills_blanks() {
        let config = SessionConfig {
            endpoint: "  ".to_string(),
            model_name: " local-model ".to_string(),
            system_prompt: "\n ".to_string(),
            generation_params: GenerationParams {
                temperature: 42.0,
                max_tokens: 0,
                presence_penalty: -1.0,
                frequency_penalty: f64::NAN,
                top_p: 3.0,
            },
            ..SessionConfig::default()
        }
        .normalized();

        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.model_name, "local-model");
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.generation_params.temperature, 10.0);
        assert_eq!(config.generation_params.max_tokens, 1);
        assert_eq!(config.generation_params.presence_penalty, 0.0);
        assert_eq!(config.generation_params.frequency_penalty, 0.0);
        assert_eq!(config.generation_params.top_p, 1.0);
    }

    #[test]
    fn debug_output_hides_the_credential() {
        let config = SessionConfig {
            api_key: "sk-secret".to_string(),
            ..SessionConfig::default()
        };

        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
