use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use teloxide::prelude::*;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::command::{BotIdentity, CommandParser};
use crate::config::Config;
use crate::dispatch::{ContentDispatcher, GenerationOutcome};
use crate::format::{format, Replacer};
use crate::gemini::Generator;
use crate::platform::telegram::{self, TelegramImages};
use crate::platform::{ImageSource, InboundMessage, OutboundReply};

/// Shared application state. Apart from the write-once bot identity it is
/// read-only, so every update task can use it without locking.
pub struct AppState {
    command: String,
    /// Set once `getMe` has succeeded.
    resolved_parser: OnceLock<CommandParser>,
    fallback_parser: CommandParser,
    dispatcher: ContentDispatcher,
    replacer: Replacer,
    generator: Arc<dyn Generator>,
    limiter: Option<Semaphore>,
}

impl AppState {
    pub fn new(config: &Config, identity: &BotIdentity, generator: Arc<dyn Generator>) -> Self {
        let limiter = match config.relay.max_concurrent_requests {
            0 => None,
            n => Some(Semaphore::new(n)),
        };
        let command = config.relay.effective_command().to_string();
        let state = Self {
            fallback_parser: CommandParser::new(&command, &BotIdentity::unresolved()),
            resolved_parser: OnceLock::new(),
            command,
            dispatcher: ContentDispatcher::new(&config.gemini),
            replacer: Replacer::markdown_v2(),
            generator,
            limiter,
        };
        state.learn_identity(identity);
        state
    }

    pub fn identity_known(&self) -> bool {
        self.resolved_parser.get().is_some()
    }

    /// Start matching the bot-qualified command. Only the first resolved
    /// identity is kept; an unresolved one changes nothing.
    pub fn learn_identity(&self, identity: &BotIdentity) {
        if identity.username.as_deref().is_some_and(|name| !name.is_empty()) {
            let _ = self
                .resolved_parser
                .set(CommandParser::new(&self.command, identity));
        }
    }

    fn parser(&self) -> &CommandParser {
        self.resolved_parser.get().unwrap_or(&self.fallback_parser)
    }

    /// Decide what, if anything, to send back for one inbound message.
    ///
    /// Generation failures are logged here and end in silence. Image fetch
    /// failures are returned to the caller, which abandons the update.
    pub async fn prepare_reply(
        &self,
        images: &dyn ImageSource,
        message: &InboundMessage,
    ) -> Result<Option<OutboundReply>> {
        let request = self.parser().parse(message);
        if !request.is_qualified {
            return Ok(None);
        }

        let image = match (&message.text, &message.image_reference) {
            (None, Some(reference)) => Some(
                images
                    .fetch_image(reference)
                    .await
                    .context("Error getting image")?,
            ),
            _ => None,
        };

        let _permit = match &self.limiter {
            Some(limiter) => Some(limiter.acquire().await.context("Request limiter closed")?),
            None => None,
        };

        let outcome = match self
            .dispatcher
            .dispatch(self.generator.as_ref(), &request, image)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    chat_id = message.chat_id,
                    message_id = message.message_id,
                    "Error generating content: {:#}",
                    e
                );
                GenerationOutcome::NoResponse
            }
        };

        Ok(format(&self.replacer, &outcome).map(|body| OutboundReply {
            chat_id: message.chat_id,
            reply_to_message_id: message.message_id,
            body,
        }))
    }
}

/// Start long polling. Every update runs as its own task with no per-chat ordering.
pub async fn run(bot: Bot, state: Arc<AppState>) -> Result<()> {
    info!("Starting Telegram bot...");

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .distribution_function(|_| None::<std::convert::Infallible>)
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("relay"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let inbound = telegram::to_inbound(&msg);
    if inbound.text.is_none() && !inbound.has_image {
        debug!(
            chat_id = inbound.chat_id,
            message_id = inbound.message_id,
            "Ignoring message without text or photo"
        );
        return Ok(());
    }

    debug!(
        chat_id = inbound.chat_id,
        message_id = inbound.message_id,
        private = inbound.is_private,
        photo = inbound.has_image,
        "Received message"
    );

    if !state.identity_known() {
        match telegram::resolve_identity(&bot).await {
            Ok(identity) => state.learn_identity(&identity),
            Err(e) => debug!(
                chat_id = inbound.chat_id,
                message_id = inbound.message_id,
                "Bot identity still unresolved: {:#}",
                e
            ),
        }
    }

    let images = TelegramImages::new(bot.clone());
    let reply = match state.prepare_reply(&images, &inbound).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return Ok(()),
        Err(e) => {
            error!(
                chat_id = inbound.chat_id,
                message_id = inbound.message_id,
                "Error handling message: {:#}",
                e
            );
            return Ok(());
        }
    };

    if let Err(e) = telegram::send_reply(&bot, &reply).await {
        error!(
            chat_id = reply.chat_id,
            message_id = reply.reply_to_message_id,
            "Error sending message: {:#}",
            e
        );
    } else {
        info!(
            chat_id = reply.chat_id,
            message_id = reply.reply_to_message_id,
            "Replied with {} chars",
            reply.body.chars().count()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::{Candidate, GeneratedResponse, Part};
    use async_trait::async_trait;
    use std::sync::Mutex;

    enum Reply {
        Fragments(Vec<&'static str>),
        NoCandidates,
        Fail,
    }

    struct FakeGenerator {
        reply: Reply,
        calls: Mutex<Vec<(String, Vec<Part>)>>,
    }

    impl FakeGenerator {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Vec<Part>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Generator for FakeGenerator {
        async fn generate(&self, model: &str, parts: Vec<Part>) -> Result<GeneratedResponse> {
            self.calls.lock().unwrap().push((model.to_string(), parts));
            match &self.reply {
                Reply::Fragments(fragments) => Ok(GeneratedResponse {
                    candidates: vec![Candidate {
                        fragments: fragments.iter().map(|f| f.to_string()).collect(),
                    }],
                }),
                Reply::NoCandidates => Ok(GeneratedResponse::default()),
                Reply::Fail => anyhow::bail!("Gemini API error (429 Too Many Requests): quota"),
            }
        }
    }

    #[derive(Default)]
    struct FakeImages {
        fail: bool,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageSource for FakeImages {
        async fn fetch_image(&self, reference: &str) -> Result<Vec<u8>> {
            self.fetched.lock().unwrap().push(reference.to_string());
            if self.fail {
                anyhow::bail!("network unreachable");
            }
            Ok(vec![0xff, 0xd8])
        }
    }

    fn state(generator: Arc<FakeGenerator>) -> AppState {
        AppState::new(&Config::default(), &BotIdentity::new("mybot"), generator)
    }

    fn group_text(text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: -500,
            message_id: 31,
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn photo(caption: Option<&str>, is_private: bool) -> InboundMessage {
        InboundMessage {
            chat_id: 77,
            message_id: 32,
            is_private,
            caption: caption.map(str::to_string),
            has_image: true,
            image_reference: Some("photo-large".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_group_command_is_relayed() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["a.b", "c!"]));
        let state = state(generator.clone());

        let reply = state
            .prepare_reply(&FakeImages::default(), &group_text("/gemini@mybot hello_world"))
            .await
            .unwrap();

        assert_eq!(
            reply,
            Some(OutboundReply {
                chat_id: -500,
                reply_to_message_id: 31,
                body: "a\\.bc\\!\n---".to_string(),
            })
        );
        assert_eq!(
            generator.calls(),
            vec![("gemini-pro".to_string(), vec![Part::text("hello_world")])]
        );
    }

    #[tokio::test]
    async fn test_group_chatter_is_ignored() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["unused"]));
        let state = state(generator.clone());

        let reply = state
            .prepare_reply(&FakeImages::default(), &group_text("just chatting"))
            .await
            .unwrap();

        assert_eq!(reply, None);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bare_group_command_sends_nothing() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["unused"]));
        let state = state(generator.clone());

        let reply = state
            .prepare_reply(&FakeImages::default(), &group_text("/gemini"))
            .await
            .unwrap();

        assert_eq!(reply, None);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_zero_candidates_sends_nothing() {
        let state = state(FakeGenerator::new(Reply::NoCandidates));
        let reply = state
            .prepare_reply(&FakeImages::default(), &group_text("/gemini hi"))
            .await
            .unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_generation_error_is_silent() {
        let generator = FakeGenerator::new(Reply::Fail);
        let state = state(generator.clone());

        let reply = state
            .prepare_reply(&FakeImages::default(), &group_text("/gemini hi"))
            .await
            .unwrap();

        assert_eq!(reply, None);
        assert_eq!(generator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_captioned_photo_goes_to_vision_model() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["A cat"]));
        let state = state(generator.clone());
        let images = FakeImages::default();

        let reply = state
            .prepare_reply(&images, &photo(Some("/gemini what is this?"), false))
            .await
            .unwrap();

        assert_eq!(reply.map(|r| r.body).as_deref(), Some("A cat\n---"));
        assert_eq!(*images.fetched.lock().unwrap(), vec!["photo-large".to_string()]);
        assert_eq!(
            generator.calls(),
            vec![(
                "gemini-pro-vision".to_string(),
                vec![Part::jpeg(vec![0xff, 0xd8]), Part::text("what is this?")]
            )]
        );
    }

    #[tokio::test]
    async fn test_private_photo_without_caption_uses_default_prompt() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["ok"]));
        let state = state(generator.clone());

        state
            .prepare_reply(&FakeImages::default(), &photo(None, true))
            .await
            .unwrap();

        let calls = generator.calls();
        assert_eq!(calls[0].1[1], Part::text("描述这张图片"));
    }

    #[tokio::test]
    async fn test_uncaptioned_group_photo_is_not_downloaded() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["unused"]));
        let state = state(generator.clone());
        let images = FakeImages::default();

        let reply = state.prepare_reply(&images, &photo(None, false)).await.unwrap();

        assert_eq!(reply, None);
        assert!(images.fetched.lock().unwrap().is_empty());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_image_fetch_failure_abandons_update() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["unused"]));
        let state = state(generator.clone());
        let images = FakeImages {
            fail: true,
            ..Default::default()
        };

        let result = state
            .prepare_reply(&images, &photo(Some("/gemini hi"), false))
            .await;

        assert!(result.is_err());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_identity_learned_after_startup() {
        let generator = FakeGenerator::new(Reply::Fragments(vec!["ok"]));
        let state = AppState::new(
            &Config::default(),
            &BotIdentity::unresolved(),
            generator.clone(),
        );
        let message = group_text("/gemini@mybot hi");
        assert!(!state.identity_known());

        state
            .prepare_reply(&FakeImages::default(), &message)
            .await
            .unwrap();

        state.learn_identity(&BotIdentity::unresolved());
        assert!(!state.identity_known());
        state.learn_identity(&BotIdentity::new("mybot"));
        assert!(state.identity_known());

        state
            .prepare_reply(&FakeImages::default(), &message)
            .await
            .unwrap();

        let queries: Vec<Part> = generator
            .calls()
            .into_iter()
            .flat_map(|(_, parts)| parts)
            .collect();
        assert_eq!(queries, vec![Part::text("@mybot hi"), Part::text("hi")]);
    }

    #[test]
    fn test_first_learned_identity_is_kept() {
        let state = AppState::new(
            &Config::default(),
            &BotIdentity::new("mybot"),
            FakeGenerator::new(Reply::NoCandidates),
        );
        state.learn_identity(&BotIdentity::new("otherbot"));

        let parsed = state.parser().parse(&group_text("/gemini@otherbot hi"));
        assert_eq!(parsed.query_text, "@otherbot hi");
    }

    #[tokio::test]
    async fn test_bounded_limiter_still_replies() {
        let mut config = Config::default();
        config.relay.max_concurrent_requests = 1;
        let generator = FakeGenerator::new(Reply::Fragments(vec!["one"]));
        let state = AppState::new(&config, &BotIdentity::unresolved(), generator);

        for _ in 0..2 {
            let reply = state
                .prepare_reply(&FakeImages::default(), &group_text("/gemini again"))
                .await
                .unwrap();
            assert_eq!(reply.map(|r| r.body).as_deref(), Some("one\n---"));
        }
    }
}
