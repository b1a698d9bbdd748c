pub mod broker;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod feed_poller;
pub mod metrics;
pub mod model_client;
pub mod rate_limiter;
pub mod repository;
pub mod repository_rpc;
pub mod scorer;
pub mod text_extractor;
pub mod writer;
