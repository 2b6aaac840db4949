//! Offline-tolerant access to a remote document store.
//!
//! A [`resource::ResourceOrchestrator`] combines a live feed
//! ([`bridge`]), a last-known-good cache ([`cache`]), a connectivity
//! belief ([`monitor`]) and a retrying executor ([`retry`]) so consumers
//! always have something to show and know how fresh it is.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod probe;
pub mod remote;
pub mod resource;
pub mod retry;
