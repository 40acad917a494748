use anyhow::Result;
use tracing::debug;

use crate::command::ParsedRequest;
use crate::config::GeminiConfig;
use crate::gemini::{GeneratedResponse, Generator, Part};

/// What a dispatched request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// Nothing to reply with; no downstream call was made or it failed.
    NoResponse,
    Generated(GeneratedResponse),
}

/// Routes a parsed request to the text model or, when an image is attached,
/// to the vision model.
#[derive(Debug, Clone)]
pub struct ContentDispatcher {
    text_model: String,
    vision_model: String,
    default_image_prompt: String,
}

impl ContentDispatcher {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            text_model: config.effective_text_model().to_string(),
            vision_model: config.effective_vision_model().to_string(),
            default_image_prompt: config.effective_default_image_prompt().to_string(),
        }
    }

    /// Makes at most one generation call. Generator errors are returned as-is
    /// for the caller to log.
    pub async fn dispatch(
        &self,
        generator: &dyn Generator,
        request: &ParsedRequest,
        image: Option<Vec<u8>>,
    ) -> Result<GenerationOutcome> {
        if !request.is_qualified {
            return Ok(GenerationOutcome::NoResponse);
        }

        let (model, parts) = match image {
            Some(bytes) => {
                let prompt = if request.query_text.is_empty() {
                    self.default_image_prompt.clone()
                } else {
                    request.query_text.clone()
                };
                (
                    self.vision_model.as_str(),
                    vec![Part::jpeg(bytes), Part::text(prompt)],
                )
            }
            None if request.query_text.is_empty() => {
                debug!("Empty query without image, skipping generation");
                return Ok(GenerationOutcome::NoResponse);
            }
            None => (
                self.text_model.as_str(),
                vec![Part::text(request.query_text.clone())],
            ),
        };

        let response = generator.generate(model, parts).await?;
        Ok(GenerationOutcome::Generated(response))
    }
}
