//! conduit-state: embedded metadata and package store for Conduit.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for connector records, instance records and uploaded packages.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns; package
//! blobs are stored raw. Composite keys (`{kind}/{tenant}/{namespace}/{name}`
//! and `{connector_key}#{instance_id}`) enable prefix scans for a namespace
//! or a connector's instances.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Reads use redb read transactions
//! and never block on writers.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult, StorageOp};
pub use store::StateStore;
pub use types::*;
