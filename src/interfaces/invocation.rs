//! Model-invocation boundary.
//!
//! The only blocking point in an evaluation run is the call to the model
//! under test. Everything upstream of this trait treats streamed and
//! non-streamed completions uniformly: a streaming transport reassembles
//! deltas into one [`ModelResponse`] before returning.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::catalog::Capability;
use crate::errors::{EngineError, Result};
use crate::resolver::ObservedCall;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user", or "assistant".
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A completed model turn after any stream reassembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ObservedCall>,
}

/// Per-call options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    /// Request a streaming completion; the transport reassembles it.
    pub stream: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.0),
            max_tokens: None,
            stream: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The model-invocation collaborator.
///
/// Implementations map errors at this boundary to
/// [`EngineError::Transport`]; the executor decides whether that aborts a
/// run. A tool-free conversation passes an empty `tools` slice.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        tools: &[Capability],
        options: &InvokeOptions,
    ) -> Result<ModelResponse>;
}

// ---------------------------------------------------------------------------
// HTTP implementation (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

/// `ModelInvoker` over an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpInvoker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpInvoker {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    /// Serialize a capability into the function-tool wire format.
    fn tool_payload(capability: &Capability) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, schema) in &capability.args_schema {
            properties.insert(
                name.clone(),
                json!({
                    "type": schema.arg_type,
                    "description": schema.description.clone().unwrap_or_default(),
                }),
            );
            if schema.required {
                required.push(name.clone());
            }
        }
        required.sort();
        json!({
            "type": "function",
            "function": {
                "name": capability.name,
                "description": capability.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        })
    }

    /// Parse the assistant message out of a completion payload.
    fn parse_response(body: &Value) -> Result<ModelResponse> {
        let message = body
            .pointer("/choices/0/message")
            .ok_or_else(|| EngineError::transport("malformed completion: no message"))?;

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            for call in calls {
                let Some(name) = call.pointer("/function/name").and_then(|v| v.as_str()) else {
                    continue;
                };
                // Arguments arrive as a JSON-encoded string.
                let arguments: HashMap<String, Value> = call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_default();
                tool_calls.push(ObservedCall::new(name, arguments));
            }
        }

        Ok(ModelResponse {
            content,
            tool_calls,
        })
    }
}

#[async_trait]
impl ModelInvoker for HttpInvoker {
    async fn invoke(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        tools: &[Capability],
        options: &InvokeOptions,
    ) -> Result<ModelResponse> {
        let mut payload = json!({
            "model": model_id,
            "messages": messages,
            // Streamed deltas are reassembled server-side by requesting a
            // non-streaming completion; callers see one response either way.
            "stream": false,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(Self::tool_payload).collect());
        }
        if let Some(temperature) = options.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&payload);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::transport(format!("request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(EngineError::transport(format!(
                "completion endpoint returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::transport(format!("invalid completion body: {}", e)))?;

        Self::parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ArgSchema, Capability};

    #[test]
    fn test_tool_payload_shape() {
        let capability = Capability::new("read_file", "Read a file")
            .with_arg("filepath", ArgSchema::required("string"))
            .with_arg("encoding", ArgSchema::optional("string"));
        let payload = HttpInvoker::tool_payload(&capability);
        assert_eq!(payload["function"]["name"], "read_file");
        assert_eq!(payload["function"]["parameters"]["required"][0], "filepath");
        assert!(payload["function"]["parameters"]["properties"]["encoding"].is_object());
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "function": {
                            "name": "list_directory",
                            "arguments": "{\"directory\": \"node-api/src\"}",
                        },
                    }],
                },
            }],
        });
        let response = HttpInvoker::parse_response(&body).unwrap();
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "list_directory");
        assert_eq!(
            response.tool_calls[0].arguments["directory"],
            json!("node-api/src")
        );
    }

    #[test]
    fn test_parse_response_rejects_empty_choices() {
        let body = json!({ "choices": [] });
        assert!(HttpInvoker::parse_response(&body).is_err());
    }
}
