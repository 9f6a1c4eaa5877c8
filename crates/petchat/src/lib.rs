//! petchat: conversational worker bridge for the pet adoption backend.
//!
//! Each conversation is served by its own long-lived worker process that
//! speaks a line-delimited JSON protocol on stdin/stdout (see the
//! `petchat-protocol` crate). The [`bridge`] module manages those processes,
//! the [`api`] module exposes them over HTTP.

pub mod api;
pub mod bridge;
pub mod worker;

pub use bridge::{BridgeConfig, BridgeError, ChatBridge, ChatReply, ChatRequest};
pub use worker::{Worker, WorkerError, WorkerSpawner};
