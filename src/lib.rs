// Re-export modules needed by the binary and integration tests
pub mod api;
pub mod config;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod rules;
pub mod server;
pub mod store;
