use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EntitiesConfig;
use crate::error::{OllamaError, ServiceError, ServiceResult};

/// Instruction prepended to chunk text when asking for entities
const ENTITY_PROMPT: &str = "List the named entities (people, organizations, places, products, events) \
that appear in the following text, in order of first appearance. Answer with a JSON array of strings \
and nothing else.\n\nText:\n";

/// Ollama API client used by the entity stage
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: &EntitiesConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::Ollama(OllamaError::Connection {
                    url: config.ollama_url.clone(),
                    source: e,
                })
            })?;

        Ok(Self {
            client,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    /// Check if Ollama is available
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);

        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Ollama health check failed");
                false
            }
        }
    }

    /// Ask the model for the entities in `text`
    pub async fn extract_entities(&self, text: &str) -> ServiceResult<Vec<String>> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt: format!("{}{}", ENTITY_PROMPT, text),
            stream: false,
            format: "json",
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OllamaError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Ollama(OllamaError::Generation {
                status: status.as_u16(),
                message,
            }));
        }

        let body: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| ServiceError::EntityExtraction {
                    message: format!("Unreadable Ollama response: {}", e),
                })?;

        debug!(model = %self.model, chars = body.response.len(), "Entity reply received");
        parse_entity_reply(&body.response)
    }
}

/// Parse the model's reply, which must be a JSON array of strings.
///
/// Some models wrap the array in an object; a single-field object holding
/// the array is accepted too.
pub(crate) fn parse_entity_reply(reply: &str) -> ServiceResult<Vec<String>> {
    let value: serde_json::Value =
        serde_json::from_str(reply.trim()).map_err(|e| ServiceError::EntityExtraction {
            message: format!("Entity reply is not JSON: {}", e),
        })?;

    let array = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
            Some((_, serde_json::Value::Array(items))) => items,
            _ => {
                return Err(ServiceError::EntityExtraction {
                    message: "Entity reply object does not hold an array".to_string(),
                });
            }
        },
        _ => {
            return Err(ServiceError::EntityExtraction {
                message: "Entity reply is not a JSON array".to_string(),
            });
        }
    };

    array
        .into_iter()
        .map(|item| match item {
            serde_json::Value::String(s) => Ok(s),
            other => Err(ServiceError::EntityExtraction {
                message: format!("Entity reply contains a non-string item: {}", other),
            }),
        })
        .collect()
}
