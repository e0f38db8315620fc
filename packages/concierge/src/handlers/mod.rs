pub mod chat;
pub mod health;
pub mod users;

// Re-export all handlers for easy route registration
pub use chat::chat_handler;
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use users::get_stage_handler;
