use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GeminiConfig;

/// One input part of a generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// Raw image bytes with an encoding hint such as `jpeg`.
    Image { format: String, bytes: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Part::Image {
            format: "jpeg".to_string(),
            bytes,
        }
    }
}

/// Ranked candidates returned for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedResponse {
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub fragments: Vec<String>,
}

/// Single-shot content generation. No state is carried between calls.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, model: &str, parts: Vec<Part>) -> Result<GeneratedResponse>;
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<RequestContent>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

impl From<Part> for RequestPart {
    fn from(part: Part) -> Self {
        match part {
            Part::Text(text) => RequestPart::Text { text },
            Part::Image { format, bytes } => RequestPart::InlineData {
                inline_data: InlineData {
                    mime_type: format!("image/{}", format),
                    data: BASE64.encode(bytes),
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    // Absent when the prompt itself was blocked.
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl From<GenerateContentResponse> for GeneratedResponse {
    fn from(response: GenerateContentResponse) -> Self {
        let candidates = response
            .candidates
            .into_iter()
            .map(|candidate| Candidate {
                fragments: candidate
                    .content
                    .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
                    .unwrap_or_default(),
            })
            .collect();
        Self { candidates }
    }
}

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, config: &GeminiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.effective_base_url().to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, model: &str, parts: Vec<Part>) -> Result<GeneratedResponse> {
        let request = GenerateContentRequest {
            contents: vec![RequestContent {
                parts: parts.into_iter().map(RequestPart::from).collect(),
            }],
        };

        let url = self.endpoint(model);

        debug!("Sending request to Gemini: {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Gemini")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error ({}): {}", status, error_body);
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;

        Ok(body.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> GeneratedResponse {
        serde_json::from_value::<GenerateContentResponse>(value)
            .unwrap()
            .into()
    }

    #[test]
    fn test_text_request_body() {
        let request = GenerateContentRequest {
            contents: vec![RequestContent {
                parts: vec![Part::text("hello").into()],
            }],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"contents": [{"parts": [{"text": "hello"}]}]})
        );
    }

    #[test]
    fn test_image_part_is_inline_base64() {
        let part: RequestPart = Part::jpeg(vec![0xff, 0xd8, 0xff]).into();
        assert_eq!(
            serde_json::to_value(&part).unwrap(),
            json!({"inline_data": {"mime_type": "image/jpeg", "data": "/9j/"}})
        );
    }

    #[test]
    fn test_response_keeps_candidate_and_fragment_order() {
        let response = decode(json!({
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": "a.b"}, {"text": "c!"}]}, "finishReason": "STOP"},
                {"content": {"role": "model", "parts": [{"text": "second"}]}}
            ],
            "usageMetadata": {"totalTokenCount": 12}
        }));
        assert_eq!(response.candidates.len(), 2);
        assert_eq!(response.candidates[0].fragments, vec!["a.b", "c!"]);
        assert_eq!(response.candidates[1].fragments, vec!["second"]);
    }

    #[test]
    fn test_blocked_prompt_has_no_candidates() {
        let response = decode(json!({"promptFeedback": {"blockReason": "SAFETY"}}));
        assert!(response.candidates.is_empty());
    }

    #[test]
    fn test_candidate_without_content_has_no_fragments() {
        let response = decode(json!({"candidates": [{"finishReason": "SAFETY"}]}));
        assert_eq!(response.candidates, vec![Candidate::default()]);
    }

    #[test]
    fn test_non_text_parts_are_skipped() {
        let response = decode(json!({
            "candidates": [{"content": {"parts": [
                {"inlineData": {"mimeType": "image/png", "data": ""}},
                {"text": "caption"}
            ]}}]
        }));
        assert_eq!(response.candidates[0].fragments, vec!["caption"]);
    }

    #[test]
    fn test_endpoint_uses_model_name() {
        let client = GeminiClient::new("key".to_string(), &GeminiConfig::default());
        assert_eq!(
            client.endpoint("gemini-pro-vision"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro-vision:generateContent"
        );
    }
}
