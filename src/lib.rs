pub mod access_log;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod proto;
pub mod route;
pub mod server;
pub mod upstream;
