pub mod admin;
pub mod auth;
pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod ingest;
pub mod inspector;
pub mod interval;
pub mod retry;
pub mod state;
pub mod store;
pub mod stream;
pub mod types;
