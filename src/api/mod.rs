//! Wire payloads shared by the dispatch router, the prober, and the HTTP
//! surface: OpenAI-style chat requests and delta frames, the two model-list
//! shapes local servers answer with, and the `/api/chat/stream` body.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseDelta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseChoice {
    pub delta: ChatResponseDelta,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatResponseChoice>,
}

/// One OpenAI-style delta frame carrying a single content fragment, used
/// when re-framing either backend into the unified stream contract.
pub fn delta_frame(content: &str) -> serde_json::Value {
    serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
}

#[derive(Debug, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct NamedModelEntry {
    pub name: String,
}

/// Tolerant model listing covering both shapes local servers answer with:
/// OpenAI-compatible `{"data": [{"id": ...}]}` and Ollama-style
/// `{"models": [{"name": ...}]}`.
#[derive(Debug, Deserialize, Default)]
pub struct ModelsResponse {
    #[serde(default)]
    pub data: Option<Vec<ModelEntry>>,
    #[serde(default)]
    pub models: Option<Vec<NamedModelEntry>>,
}

impl ModelsResponse {
    pub fn into_ids(self) -> Vec<String> {
        if let Some(data) = self.data {
            data.into_iter().map(|entry| entry.id).collect()
        } else if let Some(models) = self.models {
            models.into_iter().map(|entry| entry.name).collect()
        } else {
            Vec::new()
        }
    }
}

/// Generation settings carried on the `/api/chat/stream` body.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub web_search_enabled: bool,
}

/// Request body accepted by `POST /api/chat/stream`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamBody {
    pub base_url: String,
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub settings: GenerationSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_response_reads_openai_shape() {
        let listing: ModelsResponse =
            serde_json::from_str(r#"{"data":[{"id":"llama3"},{"id":"mistral"}]}"#).unwrap();
        assert_eq!(listing.into_ids(), vec!["llama3", "mistral"]);
    }

    #[test]
    fn models_response_reads_ollama_shape() {
        let listing: ModelsResponse =
            serde_json::from_str(r#"{"models":[{"name":"qwen2.5:7b"}]}"#).unwrap();
        assert_eq!(listing.into_ids(), vec!["qwen2.5:7b"]);
    }

    #[test]
    fn models_response_defaults_to_empty() {
        let listing: ModelsResponse = serde_json::from_str("{}").unwrap();
        assert!(listing.into_ids().is_empty());
    }

    #[test]
    fn chat_stream_body_uses_camel_case() {
        let body: ChatStreamBody = serde_json::from_str(
            r#"{
                "baseUrl": "http://localhost:1234",
                "modelId": "llama3",
                "messages": [{"role": "user", "content": "hi"}],
                "settings": {"temperature": 0.7, "topP": 0.9, "maxTokens": 1024, "webSearchEnabled": true}
            }"#,
        )
        .unwrap();
        assert_eq!(body.model_id, "llama3");
        assert!(body.settings.web_search_enabled);
        assert!(body.api_key.is_none());
    }

    #[test]
    fn request_omits_unset_sampling_fields() {
        let request = ChatRequest {
            model: "llama3".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            stream: true,
            temperature: Some(0.7),
            top_p: None,
            max_tokens: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"temperature\":0.7"));
        assert!(!json.contains("top_p"));
        assert!(!json.contains("max_tokens"));
    }
}
