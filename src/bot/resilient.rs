//! Outbound Telegram sends with automatic retry.
//!
//! Wraps `send_message` in [`crate::utils::retry_telegram_operation`] so a
//! transient network hiccup does not drop an answer the backend already paid
//! for computing.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, Message, ParseMode};

/// Send a message, retrying on transient failures with exponential backoff.
///
/// # Errors
///
/// Returns the last error after all retry attempts are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.send_message(chat_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}
