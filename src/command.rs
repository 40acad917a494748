use crate::platform::InboundMessage;

/// Who the bot is, as far as command matching cares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotIdentity {
    /// `None` when `getMe` could not be resolved at startup
    pub username: Option<String>,
}

impl BotIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
        }
    }

    pub fn unresolved() -> Self {
        Self { username: None }
    }
}

/// Result of matching one inbound message against the command token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRequest {
    pub query_text: String,
    pub is_qualified: bool,
}

impl ParsedRequest {
    fn unqualified() -> Self {
        Self::default()
    }
}

/// Recognises the relay command in message text and photo captions.
#[derive(Debug, Clone)]
pub struct CommandParser {
    plain: String,
    qualified: Option<String>,
}

impl CommandParser {
    /// `command` is the bare token, e.g. `/gemini`.
    pub fn new(command: &str, identity: &BotIdentity) -> Self {
        let qualified = identity
            .username
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| format!("{}@{}", command, name));
        Self {
            plain: command.to_string(),
            qualified,
        }
    }

    /// Text messages are matched on their text, photo messages on their caption.
    /// Private chats qualify without the command token.
    pub fn parse(&self, message: &InboundMessage) -> ParsedRequest {
        let subject = match (&message.text, message.has_image) {
            (Some(text), _) => text.as_str(),
            (None, true) => message.caption.as_deref().unwrap_or_default(),
            (None, false) => return ParsedRequest::unqualified(),
        };

        let residual = self.strip_command(subject);
        if !message.is_private && residual.is_none() {
            return ParsedRequest::unqualified();
        }

        ParsedRequest {
            query_text: residual.unwrap_or(subject).trim().to_string(),
            is_qualified: true,
        }
    }

    /// Plain prefix match, no word boundary: `/geminiabc` leaves `abc`.
    fn strip_command<'a>(&self, subject: &'a str) -> Option<&'a str> {
        self.qualified
            .as_deref()
            .and_then(|qualified| subject.strip_prefix(qualified))
            .or_else(|| subject.strip_prefix(self.plain.as_str()))
    }
}
