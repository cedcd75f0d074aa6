use crate::config::BackendConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// Alias for the stream of content fragments a provider hands back.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

// Trait defining the interface to a generation backend. One outbound
// request per user turn; the returned stream yields text fragments in
// arrival order until the channel closes or fails.
#[async_trait]
pub trait ChatApiProvider: Send + Sync {
    async fn stream_response(
        &self,
        config: &BackendConfig,
        api_key: &str,
        prompt: &str,
    ) -> Result<FragmentStream>;
}

// --- OpenAI Compatible Provider Implementation ---

#[derive(Serialize, Debug)]
struct ChatRequestBody {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct WireMessage {
    role: &'static str,
    content: String,
}

// Streaming chunk shapes. Only the fields we read are declared; providers
// send plenty more and serde skips them.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

pub struct OpenAICompatibleProvider {
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for OpenAICompatibleProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApiProvider for OpenAICompatibleProvider {
    async fn stream_response(
        &self,
        config: &BackendConfig,
        api_key: &str,
        prompt: &str,
    ) -> Result<FragmentStream> {
        log::info!(
            "Sending stream request to {} using model: {}",
            config.api_url,
            config.model
        );

        let request_body = ChatRequestBody {
            model: config.model.clone(),
            messages: vec![WireMessage {
                role: "user",
                content: prompt.to_string(),
            }],
            stream: true,
        };

        let request_url = format!("{}/chat/completions", config.api_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&request_url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send stream request to generation backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read error body>".to_string());
            log::error!("Stream request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!(
                "API stream request failed with status {}: {}",
                status,
                error_body
            ));
        }

        // Process the SSE stream: each event carries a JSON chunk, a ping,
        // or the [DONE] terminator.
        let event_stream = response.bytes_stream().eventsource();

        let fragments = event_stream
            .map(|event_result| -> Result<Option<String>> {
                let event = event_result.context("Error reading stream event")?;
                let event_data = event.data.trim();

                if event_data == "[DONE]" {
                    log::debug!("Stream finished with [DONE]");
                    return Ok(None);
                }

                match serde_json::from_str::<StreamChunk>(event_data) {
                    Ok(chunk) => {
                        let delta = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|choice| choice.delta.content);
                        Ok(delta)
                    }
                    Err(e) => {
                        // Providers interleave keep-alive pings; skip those,
                        // surface everything else as a stream error.
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(event_data) {
                            if value.get("type") == Some(&serde_json::Value::String("ping".into())) {
                                log::debug!("Received stream ping event, skipping");
                                return Ok(None);
                            }
                        }
                        log::warn!("Failed to parse stream chunk: {} - data: {}", e, event_data);
                        Err(anyhow::Error::from(e)
                            .context(format!("Failed to parse stream chunk: {}", event_data)))
                    }
                }
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None, // [DONE] and pings carry no content
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(fragments))
    }
}
