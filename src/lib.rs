//! Kelly Telegram Bot
//!
//! A Telegram front-end for the KellyBot backend API. Incoming text messages
//! are forwarded to the backend's `/api/v1/chat` endpoint and the answers are
//! relayed back to the chat, with per-user debug mode and local persistence
//! of recent conversation turns.

/// KellyBot backend API client
pub mod api;
/// Telegram bot handlers and messaging helpers
pub mod bot;
/// Configuration management
pub mod config;
/// Local JSON persistence for user flags and conversation history
pub mod storage;
/// Text formatting, message splitting and retry utilities
pub mod utils;
