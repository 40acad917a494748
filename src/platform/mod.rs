pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

/// A message received from the chat platform, flattened to what the relay needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub message_id: i32,
    pub is_private: bool,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub has_image: bool,
    /// Platform file handle of the largest attached photo
    pub image_reference: Option<String>,
}

/// The reply to send back into the originating chat.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReply {
    pub chat_id: i64,
    pub reply_to_message_id: i32,
    pub body: String,
}

/// Resolves an image reference to its raw bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_image(&self, reference: &str) -> Result<Vec<u8>>;
}
