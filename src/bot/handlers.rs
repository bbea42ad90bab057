//! Command and text message handlers.
//!
//! Text messages are forwarded to the KellyBot backend; the answer comes
//! back formatted as Telegram HTML. Users listed in `AUTHORIZED_DEBUG_USERS`
//! can toggle a per-user debug mode that appends the backend's source
//! references to every answer.

use crate::api::{KellyApiClient, SourceRef};
use crate::bot::messaging::send_long_message;
use crate::config::Settings;
use crate::storage::{ConversationTurn, JsonStore};
use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ParseMode};
use teloxide::utils::command::BotCommands;
use tracing::{debug, info, warn};

/// Bot commands
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Comandos disponibles:")]
pub enum Command {
    /// Welcome message
    #[command(description = "Inicia la conversación.")]
    Start,
    /// Usage help
    #[command(description = "Muestra la ayuda.")]
    Help,
    /// Toggle source references in answers (authorized users only)
    #[command(description = "Activa/desactiva la vista de fuentes (on|off).")]
    Debug(String),
}

/// Telegram user id of the sender, or 0 when the update carries none
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Handle `/start`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn start(bot: Bot, msg: Message) -> Result<()> {
    let user_name = msg
        .from
        .as_ref()
        .map_or_else(|| "usuario".to_string(), |u| u.first_name.clone());
    info!("/start from user {}", get_user_id_safe(&msg));

    let welcome = format!(
        "¡Hola {user_name}! 👋 Soy Kelly, tu asistente virtual de Computo Contable Soft.\n\n\
         Estoy aquí para ayudarte con tus consultas sobre <b>MiAdminXML</b> y \
         <b>MiExpedienteContable</b>.\n\n\
         Puedes preguntarme directamente sobre:\n\
         • Cómo usar los programas\n\
         • Resolución de problemas comunes\n\
         • Información de licencias y precios\n\
         • Requisitos de sistema\n\n\
         Simplemente escribe tu pregunta. Para ayuda general usa /help."
    );

    bot.send_message(msg.chat.id, welcome)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

/// Handle `/help`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn help(bot: Bot, msg: Message, settings: Arc<Settings>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!("/help from user {user_id}");

    let mut help_text = String::from(
        "<b>¿Cómo usar a Kelly?</b>\n\n\
         1. <b>Haz tu pregunta:</b> escribe tu consulta sobre MiAdminXML o \
         MiExpedienteContable en el chat.\n\
         2. <b>Sé específico:</b> mientras más clara sea tu pregunta, mejor podré ayudarte.\n\n\
         <b>Comandos:</b>\n\
         /start - Mensaje de bienvenida.\n\
         /help - Esta ayuda.\n",
    );
    if settings.debug_users().contains(&user_id) {
        help_text.push_str(
            "/debug <code>on</code>|<code>off</code> - Vista de fuentes \
             (solo usuarios autorizados).\n",
        );
    }

    bot.send_message(msg.chat.id, help_text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

/// Handle `/debug on|off`
///
/// # Errors
///
/// Returns an error if the reply cannot be sent or the flag cannot be
/// persisted.
pub async fn debug(
    bot: Bot,
    msg: Message,
    arg: String,
    settings: Arc<Settings>,
    store: Arc<JsonStore>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);

    if !settings.debug_users().contains(&user_id) {
        warn!("User {user_id} tried /debug without authorization");
        bot.send_message(
            msg.chat.id,
            "Lo siento, este comando es solo para usuarios autorizados.",
        )
        .await?;
        return Ok(());
    }

    let enabled = match arg.trim().to_lowercase().as_str() {
        "on" => true,
        "off" => false,
        _ => {
            bot.send_message(msg.chat.id, "Uso: /debug <code>on</code> o /debug <code>off</code>")
                .parse_mode(ParseMode::Html)
                .await?;
            return Ok(());
        }
    };

    if let Err(e) = store.set_debug_mode(user_id, enabled).await {
        warn!("Failed to persist debug flag for user {user_id}: {e}");
        bot.send_message(
            msg.chat.id,
            "No se pudo cambiar el modo debug (problema de persistencia).",
        )
        .await?;
        return Ok(());
    }

    if enabled {
        info!("Debug mode enabled for user {user_id}");
        bot.send_message(
            msg.chat.id,
            "✅ Modo Debug activado. Ahora verás las fuentes en las respuestas.",
        )
        .await?;
    } else {
        info!("Debug mode disabled for user {user_id}");
        bot.send_message(msg.chat.id, "☑️ Modo Debug desactivado.")
            .await?;
    }
    Ok(())
}

/// Handle a plain text message: forward it to the backend and relay the
/// answer.
///
/// # Errors
///
/// Returns an error if a Telegram send fails after retries. Backend failures
/// never error out; they are mapped to a user-facing message. Persistence is
/// best effort and never blocks the reply.
pub async fn handle_text(
    bot: Bot,
    msg: Message,
    settings: Arc<Settings>,
    store: Arc<JsonStore>,
    api: Arc<KellyApiClient>,
) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        warn!("Text message without sender information; ignoring.");
        return Ok(());
    };
    let user_id = user.id.0.cast_signed();
    let chat_id = msg.chat.id;

    // Unknown commands are not questions for the backend
    if text.starts_with('/') {
        debug!("Ignoring unhandled command from user {user_id}");
        return Ok(());
    }

    let is_group = msg.chat.is_group() || msg.chat.is_supergroup();
    let Some(query) = extract_query(text, is_group, settings.trigger_word.as_deref()) else {
        // Group chatter without the trigger word is none of our business
        return Ok(());
    };

    let session_id = format!("tg_user_{user_id}");
    info!(
        "Processing message from user {user_id}: '{}'",
        crate::utils::truncate_str(&query, 50)
    );

    if let Err(e) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
        warn!("Failed to send typing action: {e}");
    }

    match api.chat(&query, &session_id).await {
        Ok(response) => {
            let debug_authorized = settings.debug_users().contains(&user_id);
            let show_sources = debug_authorized && store.debug_mode(user_id).await;

            let turn = ConversationTurn {
                chat_id: chat_id.0,
                user_id,
                message: query.clone(),
                response: response.answer,
                timestamp: Utc::now(),
            };
            let reply =
                persist_and_build_reply(&store, turn, &response.sources, show_sources).await;

            send_long_message(&bot, chat_id, &reply).await?;
        }
        Err(e) => {
            warn!("Kelly API call failed for session {session_id}: {e}");
            bot.send_message(chat_id, e.user_message()).await?;
        }
    }

    Ok(())
}

/// Record the turn and assemble the reply text.
///
/// The answer already cost a backend round trip, so a storage failure is
/// logged and the reply still goes out.
async fn persist_and_build_reply(
    store: &JsonStore,
    turn: ConversationTurn,
    sources: &[SourceRef],
    show_sources: bool,
) -> String {
    let mut reply = turn.response.clone();
    if let Err(e) = store.record_turn(turn).await {
        warn!("Failed to persist conversation turn: {e}");
    }
    if show_sources {
        reply.push_str(&render_sources(sources));
    }
    reply
}

/// Decide whether a message is addressed to the bot and extract the query.
///
/// Private chats: every text message counts. Group chats: only messages
/// containing the trigger word (case-insensitive), which is stripped from
/// the forwarded query. A group message that is nothing but the trigger word
/// is ignored.
fn extract_query(text: &str, is_group: bool, trigger_word: Option<&str>) -> Option<String> {
    if !is_group {
        let trimmed = text.trim();
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    }

    let trigger = trigger_word?;
    // Case-insensitive match on the original text so byte offsets stay valid
    let pattern = Regex::new(&format!("(?i){}", regex::escape(trigger))).ok()?;
    let mat = pattern.find(text)?;

    let mut query = String::with_capacity(text.len());
    query.push_str(&text[..mat.start()]);
    query.push_str(&text[mat.end()..]);
    let query = query.trim().trim_start_matches([',', ':']).trim();

    (!query.is_empty()).then(|| query.to_string())
}

/// Render the debug sources block appended to answers.
///
/// Uses the markdown the formatter converts to Telegram HTML later.
fn render_sources(sources: &[SourceRef]) -> String {
    if sources.is_empty() {
        return "\n\n---\n*Fuentes (Debug):* Ninguna".to_string();
    }

    let lines: Vec<String> = sources
        .iter()
        .map(|src| match src.score {
            Some(score) => format!("`{}` ({score:.3})", src.source_id),
            None => format!("`{}`", src.source_id),
        })
        .collect();

    format!("\n\n---\n*Fuentes (Debug):*\n • {}", lines.join("\n • "))
}
