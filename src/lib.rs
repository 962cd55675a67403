//! # EmberDB
//!
//! An embedded, append-only, log-structured key/value engine with
//! secondary data structures (ordered maps, lists, sets, sorted sets).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Transactions                         │
//! │        (single writer / many readers, RW lock)           │
//! └───────────────┬─────────────────────────────────────────┘
//!                 │ commit
//!        ┌────────▼────────┐        ┌──────────────────────┐
//!        │  Entry codec    │───────>│  Active segment      │
//!        │  (framed, crc)  │ append │  <fid>.dat, rotates  │
//!        └────────┬────────┘        └──────────────────────┘
//!                 │ after append
//!        ┌────────▼────────────────────────────────────────┐
//!        │  In-memory indexes                               │
//!        │  (ordered map / list / set / sorted set, TTL)    │
//!        └─────────────────────────────────────────────────┘
//! ```
//!
//! Transactions buffer writes in memory; commit encodes them into the
//! active segment with a trailing committed marker, rotating segments as
//! they fill, then updates the indexes. Crash recovery replays segment
//! files and keeps exactly the transactions whose marker made it to disk.

pub mod bptree;
pub mod bucket_meta;
pub mod config;
pub mod data_file;
pub mod db;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod flock;
pub mod index;
pub mod ttl;
pub mod tx;
pub mod tx_id;

pub use config::{EntryIdxMode, Options, RwMode};
pub use db::Db;
pub use entry::{DataStructure, PERSISTENT};
pub use error::{Error, Result};
pub use tx::Tx;
