//! Core functionality shared by every OmniCore crate.
//!
//! This crate provides the ambient pieces the identity and federation engines
//! are built on:
//!
//! - **config**: layered TOML + environment configuration
//! - **error**: the shared storage/configuration error type
//! - **logging**: tracing subscriber initialisation
//! - **store**: per-record persistence (SQLite or in-memory)
//! - **time**: wall clock abstraction used for expiry decisions

pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod time;

pub use config::{
    AuthSettings, FederationSettings, LogFormat, LoggingSettings, NetworkSettings, OmniConfig,
    ServerSettings, StorageSettings,
};
pub use error::{CoreError, Result};
#[cfg(feature = "sqlite")]
pub use store::SqliteRecordStore;
pub use store::{Loaded, MemoryRecordStore, RecordKind, RecordStore, RecordStoreExt, StoredRecord};
pub use time::{current_timestamp_ms, Clock, ManualClock, SystemClock};
