// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Three-tier cache for converted datasets and computed results.
//!
//! - [`MemoryIndex`]: bounded LRU of hot store paths
//! - [`DiskStore`]: one converted store file per dataset, under a byte budget
//! - [`ResultCache`]: fingerprint-keyed results with per-class TTLs
//!
//! [`CacheCoordinator`] is the only type most callers need.

pub mod config;
pub mod coordinator;
pub mod disk;
pub mod error;
pub mod fingerprint;
pub mod memory;
pub mod result;

pub use config::CacheConfig;
pub use coordinator::{CacheCoordinator, Located, MemoryStats, Tier};
pub use disk::{DiskStore, Placement, validate_dataset_id};
pub use error::CacheError;
pub use fingerprint::{canonical_json, fingerprint};
pub use memory::{DEFAULT_MEMORY_ENTRIES, MemoryIndex};
pub use result::{MemoryResultCache, RedisResultCache, ResultCache, ResultClass};

pub type Result<T> = std::result::Result<T, CacheError>;
