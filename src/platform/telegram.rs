use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, MessageId, ParseMode, ReplyParameters};

use crate::command::BotIdentity;
use crate::platform::{ImageSource, InboundMessage, OutboundReply};

/// Flatten a teloxide message. Of a photo's sizes only the largest (last) is kept.
pub fn to_inbound(msg: &Message) -> InboundMessage {
    let largest_photo = msg.photo().and_then(|sizes| sizes.last());

    InboundMessage {
        chat_id: msg.chat.id.0,
        message_id: msg.id.0,
        is_private: msg.chat.is_private(),
        text: msg.text().map(str::to_string),
        caption: msg.caption().map(str::to_string),
        has_image: largest_photo.is_some(),
        image_reference: largest_photo.map(|photo| photo.file.id.0.clone()),
    }
}

/// Ask Telegram who we are. A bot without a username resolves to an unresolved identity.
pub async fn resolve_identity(bot: &Bot) -> Result<BotIdentity> {
    let me = bot.get_me().await.context("Failed to resolve bot identity")?;
    Ok(me
        .user
        .username
        .clone()
        .map(BotIdentity::new)
        .unwrap_or_else(BotIdentity::unresolved))
}

/// Send the reply as MarkdownV2, threaded under the original message.
pub async fn send_reply(bot: &Bot, reply: &OutboundReply) -> Result<()> {
    bot.send_message(ChatId(reply.chat_id), reply.body.as_str())
        .parse_mode(ParseMode::MarkdownV2)
        .reply_parameters(ReplyParameters::new(MessageId(reply.reply_to_message_id)))
        .await
        .context("Failed to send reply")?;
    Ok(())
}

/// Downloads photos through the Bot API file endpoint.
pub struct TelegramImages {
    bot: Bot,
}

impl TelegramImages {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ImageSource for TelegramImages {
    async fn fetch_image(&self, reference: &str) -> Result<Vec<u8>> {
        let file = self
            .bot
            .get_file(FileId(reference.to_string()))
            .await
            .context("Failed to get file")?;

        let mut buf = Vec::new();
        self.bot
            .download_file(&file.path, &mut buf)
            .await
            .context("Failed to download image")?;

        Ok(buf)
    }
}
