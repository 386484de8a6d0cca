//! A Google File System style chunk store.
//!
//! A single [`master::MasterServer`] owns the namespace and chunk metadata
//! and grants primary leases. [`chunkserver::Chunkserver`]s store chunk
//! replicas and apply mutations in the order their primary picks.
//! [`client::Client`] pushes data along a chain of replicas and then asks the
//! primary to commit it.

pub mod chunk;
pub mod chunkserver;
pub mod client;
pub mod common;
pub mod config;
pub mod core;
pub mod lease;
pub mod master;
pub mod placement;
