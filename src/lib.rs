//! marksync: a personal bookmark list that stays in sync across sessions.
//!
//! Every open session keeps its own in-memory list and feeds it from three
//! sources: its own optimistic writes, a per-user broadcast topic written by
//! the other sessions, and the store's change feed. All three go through the
//! same idempotent operations in [`managers::bookmark_state`], so the lists
//! converge no matter which notification arrives first.
//!
//! This library crate exposes all modules for use by the binaries and integration tests.

pub mod app;
pub mod database;
pub mod managers;
pub mod platform;
pub mod realtime;
pub mod rpc_handler;
pub mod services;
pub mod store;
pub mod types;
pub mod view;
