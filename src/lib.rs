pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod types;
pub mod ui;

pub use error::{ChatError, ChatResult};
