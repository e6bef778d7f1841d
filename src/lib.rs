//! Borealis server — realtime chat backbone over persistent TCP.
//!
//! A single authoritative server speaking a newline-delimited JSON control
//! protocol on one port and a byte-splicing file-transfer bridge on a
//! second port. Sessions, presence, direct and room messaging with offline
//! queuing, a friend graph, file-transfer signaling, and multi-party voice
//! call relay all share the same connection registry, identity, and
//! framing pipeline.

pub mod auth;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod envelope;
pub mod error;
pub mod file;
pub mod framing;
pub mod friend;
pub mod message;
pub mod models;
pub mod offline;
pub mod presence;
pub mod registry;
pub mod room;
pub mod router;
pub mod server;
pub mod store;
pub mod validator;
pub mod voice;
