/// Command and text message handlers
pub mod handlers;
/// Formatted message sending with automatic splitting
pub mod messaging;
/// Outbound sends with retry on transient failures
pub mod resilient;
