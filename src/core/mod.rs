pub mod capability;
pub mod chat_stream;
pub mod config;
pub mod library;
pub mod message;
pub mod prompt;
pub mod store;
pub mod turn;
