pub mod attachments;
pub mod blob_store;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod database;
pub mod llm_client;
pub mod runtime;
pub mod server;
pub mod supervision;
pub mod title;
