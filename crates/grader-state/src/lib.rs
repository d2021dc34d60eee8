//! Grader-State: storage backends for the rubric grader
//!
//! This crate provides the persistence layer the grading pipeline leans on:
//! an opaque key/value cache with per-entry TTL and a rubric lookup store.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: safe concurrent access and graceful failure. Nothing here knows
//! what a verdict or a rubric criterion *means*.
//!
//! ## Key Components
//!
//! - `CacheBackend`: async get/set/delete/clear over JSON payloads with TTL
//! - `MemoryCacheBackend`: process-local backend behind a `Mutex`
//! - `FsCacheBackend`: sharded JSON files with atomic writes
//! - `RubricStore` / `MemoryRubricStore`: rubric lookup by artifact name
//! - `fakes`: failing backends for degradation tests

mod error;
pub mod fakes;
mod fs;
mod memory;
pub mod storage_traits;

pub use error::StorageError;
pub use fs::FsCacheBackend;
pub use memory::{MemoryCacheBackend, MemoryRubricStore};
pub use storage_traits::{
    BackendStats, CacheBackend, CacheEntry, CacheKey, RubricStore, StorageResult,
    StoredCriterion, StoredRubric,
};
