//! Common messaging utilities for the Telegram bot.
//!
//! All user-visible replies go through here so formatting and message
//! splitting stay consistent across handlers.

use crate::bot::resilient::send_message_resilient;
use crate::utils;
use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};

/// Maximum message length with safety margin. Telegram's official limit is
/// 4096; 4000 leaves room for the HTML tags formatting adds.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

/// Format an answer as Telegram HTML and send it, splitting across several
/// messages when it exceeds [`TELEGRAM_MESSAGE_LIMIT`].
///
/// Splitting happens on the raw text so code fences are closed and reopened
/// correctly; each part is converted to HTML after the split.
///
/// # Errors
///
/// Returns an error if any part fails to send after retries.
pub async fn send_long_message(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    let parts = utils::split_long_message(text, TELEGRAM_MESSAGE_LIMIT);

    for part in parts {
        let formatted = utils::format_text(&part);
        send_message_resilient(bot, chat_id, formatted, Some(ParseMode::Html)).await?;
    }

    Ok(())
}
