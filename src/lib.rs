//! Devgate - per-project dev server orchestration
//!
//! This library runs one dev server container per project and makes it
//! reachable under its own subdomain:
//! - Allocates non-overlapping port windows per project and persists them
//!   in the project's settings, so they survive restarts
//! - Starts, stops and probes dev server containers through Docker
//! - Maps `<user>-<project>.<base domain>` to the container's port
//! - Serves those routes through a Host-based reverse proxy with WebSocket
//!   passthrough for hot reload
//! - Stops dev servers that have been up longer than the idle timeout

pub mod admin;
pub mod config;
pub mod container;
pub mod db;
pub mod docker;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod routes;
pub mod store;
