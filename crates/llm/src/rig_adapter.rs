use futures::{StreamExt, future};
use rig::completion::{CompletionError, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde_json::Value;
use snafu::{ResultExt, ensure};

use crate::message::{Message, Role};
use crate::provider::{
    BoxFuture, ChatBackend, CompletionsFailedSnafu, EmptyMessageSetSnafu, FragmentStream,
    HttpClientSnafu, MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderResult,
    StreamRequest,
};

pub const RIG_OPENAI_BACKEND_ID: &str = "openai-chat-completions";

/// OpenAI-compatible chat-completions backend driven through Rig.
#[derive(Debug, Clone, Default)]
pub struct RigBackend;

impl RigBackend {
    pub fn new() -> Self {
        Self
    }

    fn build_client(provider: &ProviderConfig) -> ProviderResult<openai::Client> {
        ensure!(
            !provider.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "build-client",
                endpoint: provider.endpoint.clone(),
            }
        );

        let mut builder = openai::Client::builder().api_key(provider.api_key.as_str());
        if !provider.endpoint.is_empty() {
            builder = builder.base_url(provider.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &Message) -> Option<RigMessage> {
        match message.role() {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content())),
            Role::Assistant => Some(RigMessage::assistant(message.content())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig sends the preamble as the leading system message, so system-role
        // history entries are folded into it.
        for message in &request.messages {
            if message.role() == Role::System && !message.content().trim().is_empty() {
                preamble_parts.push(message.content().to_string());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open(provider: ProviderConfig, request: StreamRequest) -> ProviderResult<FragmentStream> {
        let client = Self::build_client(&provider)?;
        let model = client
            .completion_model(request.model_id.clone())
            .completions_api();

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                model_id: request.model_id.clone(),
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(&request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if !request.extra_fields.is_empty() {
            builder = builder.additional_params(Value::Object(request.extra_fields.clone()));
        }

        tracing::debug!(
            model_id = %request.model_id,
            endpoint = %provider.endpoint,
            message_count = request.messages.len(),
            "opening chat completion stream"
        );

        let stream = builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })?;

        // Dropping the mapped stream drops Rig's response body, which closes the connection.
        Ok(Box::pin(stream.filter_map(|item| {
            future::ready(Self::map_stream_item(item))
        })))
    }

    fn map_stream_item<R>(
        item: Result<StreamedAssistantContent<R>, CompletionError>,
    ) -> Option<ProviderResult<String>>
    where
        R: Clone + Unpin,
    {
        match item {
            Ok(StreamedAssistantContent::Text(text)) if text.text.is_empty() => None,
            Ok(StreamedAssistantContent::Text(text)) => Some(Ok(text.text)),
            // Reasoning, tool calls and the final usage record never reach the output.
            Ok(_) => None,
            Err(source) => {
                tracing::warn!(error = %source, "provider stream emitted an error chunk");
                Some(Err(ProviderError::CompletionsFailed {
                    stage: "stream-chunk",
                    source,
                }))
            }
        }
    }
}

impl ChatBackend for RigBackend {
    fn id(&self) -> &str {
        RIG_OPENAI_BACKEND_ID
    }

    fn open_stream(
        &self,
        provider: ProviderConfig,
        request: StreamRequest,
    ) -> BoxFuture<'static, ProviderResult<FragmentStream>> {
        Box::pin(Self::open(provider, request))
    }
}
