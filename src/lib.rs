pub mod admin;
pub mod backoff;
pub mod config;
pub mod feed_core;
pub mod pipeline;
pub mod publisher;
pub mod query;
