//! Cache-first local data layer for a WhatsApp business chat client.
//!
//! - [`cache`]: Local Store and Cache Manager, partitioned by account scope
//! - [`sync`]: when to fetch, how to reconcile, offline and reconnect handling
//! - [`api`]: backend transport and domain fetches
//! - [`adapters`]: view models for chat list, conversation and optimistic sends

pub mod adapters;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod sync;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
