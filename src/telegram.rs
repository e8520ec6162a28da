//! Telegram front end.
//!
//! Updates arrive through the backend's webhook route and are handed to
//! [`TelegramBot::handle_update`]. Replies go out through a [`ChatApi`]; the
//! production implementation calls the Bot API over HTTPS with `ureq`, which
//! blocks, so every call is moved onto Tokio's blocking pool.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    INVALID_VIDEO_MESSAGE, already_in_progress_message,
    downloader::{AudioFormat, Downloader},
    playback_query,
    video_id::extract_video_id,
};

pub const USAGE: &str = "Use this bot to get an audio from youtube videos.
Examples:
- /listen https://youtu.be/b8g1o8Ph7LQ
- /listen b8g1o8Ph7LQ
- /listen b8g1o8Ph7LQ mp3
- https://youtu.be/b8g1o8Ph7LQ
- https://www.youtube.com/watch?v=b8g1o8Ph7LQ
etc...
";

pub const WAIT_MESSAGE: &str = "Wait a moment, downloading the content for you";

const API_BASE: &str = "https://api.telegram.org";
const API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    #[serde(default)]
    pub username: Option<String>,
}

impl Message {
    fn sender(&self) -> &str {
        self.from
            .as_ref()
            .and_then(|user| user.username.as_deref())
            .unwrap_or("unknown")
    }
}

/// What a message asks the bot to do.
#[derive(Debug, PartialEq, Eq)]
pub enum BotCommand<'a> {
    Info,
    Listen {
        target: &'a str,
        format: Option<AudioFormat>,
    },
}

/// Interprets a message text. `/start` and `/info` ask for help; `/listen`
/// and anything that is not a known command ask for a download.
pub fn parse_command(text: &str) -> BotCommand<'_> {
    let text = text.trim();
    let Some(rest) = text.strip_prefix('/') else {
        return listen_args(text);
    };
    let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    // In groups commands may be addressed as `/listen@SomeBot`.
    let name = head.split_once('@').map_or(head, |(name, _)| name);
    match name {
        "start" | "info" => BotCommand::Info,
        "listen" => listen_args(args),
        _ => listen_args(text),
    }
}

fn listen_args(args: &str) -> BotCommand<'_> {
    let mut parts = args.split_whitespace();
    BotCommand::Listen {
        target: parts.next().unwrap_or(""),
        format: parts.next().and_then(AudioFormat::parse),
    }
}

/// Outgoing side of the bot.
pub trait ChatApi: Send + Sync + 'static {
    fn send_text(&self, chat_id: i64, reply_to: i64, text: &str) -> Result<()>;
    fn send_typing(&self, chat_id: i64) -> Result<()>;
}

/// [`ChatApi`] backed by the Telegram Bot API.
pub struct TelegramClient {
    agent: ureq::Agent,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(API_TIMEOUT).build(),
            base_url: format!("{API_BASE}/bot{token}"),
        }
    }

    fn call(&self, method: &str, payload: serde_json::Value) -> Result<()> {
        let response = self
            .agent
            .post(&format!("{}/{method}", self.base_url))
            .send_json(payload)
            .with_context(|| format!("calling {method}"))?;
        let reply: ApiReply = response
            .into_json()
            .with_context(|| format!("parsing {method} response"))?;
        if !reply.ok {
            bail!(
                "{method} rejected: {}",
                reply.description.unwrap_or_default()
            );
        }
        Ok(())
    }
}

impl ChatApi for TelegramClient {
    fn send_text(&self, chat_id: i64, reply_to: i64, text: &str) -> Result<()> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": chat_id,
                "text": text,
                "reply_to_message_id": reply_to,
                "disable_web_page_preview": true,
            }),
        )
    }

    fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.call(
            "sendChatAction",
            json!({
                "chat_id": chat_id,
                "action": "typing",
            }),
        )
    }
}

/// Handles chat updates against a shared [`Downloader`].
#[derive(Clone)]
pub struct TelegramBot {
    api: Arc<dyn ChatApi>,
    downloader: Downloader,
    listen_base_url: String,
}

impl TelegramBot {
    /// `listen_base_url` is the public URL of the playback page, e.g.
    /// `https://example.com/listen`.
    pub fn new(api: Arc<dyn ChatApi>, downloader: Downloader, listen_base_url: String) -> Self {
        Self {
            api,
            downloader,
            listen_base_url,
        }
    }

    pub async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let text = message.text.as_deref().unwrap_or("");
        match parse_command(text) {
            BotCommand::Info => {
                info!(user = message.sender(), "received info request");
                self.reply(&message, USAGE).await;
            }
            BotCommand::Listen { target, format } => {
                info!(user = message.sender(), %target, "received listen request");
                self.listen(&message, target, format).await;
            }
        }
    }

    async fn listen(&self, message: &Message, target: &str, format: Option<AudioFormat>) {
        let id = extract_video_id(target);
        if id.is_empty() {
            self.reply(message, INVALID_VIDEO_MESSAGE).await;
            return;
        }

        let guard = match self.downloader.claim(&id) {
            Ok(guard) => guard,
            Err(err) => {
                info!(%id, %err, "rejecting duplicate request");
                self.reply(message, &already_in_progress_message(&id)).await;
                return;
            }
        };

        self.reply(message, WAIT_MESSAGE).await;
        self.typing(message).await;
        let result = self.downloader.resolve(&id, format.as_ref()).await;
        drop(guard);

        match result {
            Ok(resolution) => {
                let link = format!(
                    "{}?{}",
                    self.listen_base_url,
                    playback_query(&resolution.file_name)
                );
                self.reply(message, &link).await;
            }
            Err(err) => {
                warn!(%id, %err, "download failed");
                self.reply(message, &format!("Cannot load a video with id {id}"))
                    .await;
            }
        }
    }

    async fn reply(&self, message: &Message, text: &str) {
        let api = self.api.clone();
        let chat_id = message.chat.id;
        let reply_to = message.message_id;
        let text = text.to_string();
        match tokio::task::spawn_blocking(move || api.send_text(chat_id, reply_to, &text)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Cannot send a message to telegram: {err:#}"),
            Err(err) => warn!("Telegram send task failed: {err}"),
        }
    }

    async fn typing(&self, message: &Message) {
        let api = self.api.clone();
        let chat_id = message.chat.id;
        match tokio::task::spawn_blocking(move || api.send_typing(chat_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Cannot send chat action to telegram: {err:#}"),
            Err(err) => warn!("Telegram chat action task failed: {err}"),
        }
    }
}
