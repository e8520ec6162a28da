#![forbid(unsafe_code)]

//! Library half of listentube: turns a video link into a locally stored audio
//! file by driving an external downloader, and shares that machinery between
//! the HTTP backend and the Telegram bot.

pub mod config;
pub mod downloader;
pub mod error;
pub mod in_flight;
pub mod security;
pub mod storage;
pub mod telegram;
pub mod video_id;

#[cfg(test)]
mod test_support;

/// Help text shown when the submitted value does not contain an identifier.
pub const INVALID_VIDEO_MESSAGE: &str = "Parameter 'v' is invalid. Must be an url like 'https://youtu.be/b8g1o8Ph7LQ' or 'https://www.youtube.com/watch?v=b8g1o8Ph7LQ' or just 'b8g1o8Ph7LQ'.";

/// Message returned to anyone who asks for a video that is already downloading.
pub fn already_in_progress_message(id: &str) -> String {
    format!("Other request is downloading video {id} now, please try later")
}

/// Query string of the playback page for `file_name`, starting at second 0.
pub fn playback_query(file_name: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("v", file_name)
        .append_pair("t", "0")
        .finish()
}
