//! ctfgate - runs CTF task daemons behind a reverse proxy and generates
//! per-user task instances
//!
//! This library provides:
//! - A control-plane child process that runs programs and answers RPC over a Unix socket
//! - A supervisor that owns the control plane and applies program sets to it
//! - An nginx route table rebuilt and reloaded as task sockets come and go
//! - A debounced task watcher that restarts only the daemons whose files changed
//! - Database-coordinated generation with a pregenerated pool and multi-task groups

pub mod cache;
pub mod client;
pub mod config;
pub mod control;
pub mod daemon;
pub mod db;
pub mod error;
pub mod generate;
pub mod program;
pub mod routes;
pub mod rpc;
pub mod supervisor;
pub mod tasks;
pub mod watch;
