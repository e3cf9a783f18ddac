//! Gantry Network Server Core
//!
//! The state-keeping heart of the network server:
//! - Redis-backed device-session store with MIC-based session disambiguation
//! - PostgreSQL-backed downlink device queue and its scheduling policy
//! - application-server client pool (gRPC, optional mutual TLS)

pub mod asclient;
pub mod config;
pub mod error;
pub mod storage;
pub mod tracing_init;
