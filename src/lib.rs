//! Library crate for reconsuite-rs: scan orchestration, live output fan-out and
//! result parsing behind a small HTTP/WebSocket service.
pub mod builtin;
pub mod config;
pub mod detect;
pub mod error;
pub mod executor;
pub mod hub;
pub mod parsers;
pub mod ports;
pub mod runner;
pub mod server;
pub mod specs;
pub mod store;
pub mod types;
pub mod validate;
