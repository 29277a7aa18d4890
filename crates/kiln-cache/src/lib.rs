//! Kiln Cache - content-addressed shared build-output cache
//!
//! Entries live under `<root>/v1/entries/<key>/` as a `manifest.json` plus a
//! mirrored `files/` tree. Every write is staged under a unique temporary
//! name in the destination directory and published with a single rename, so
//! concurrent readers in other processes only ever observe a missing entry
//! or a complete one.

pub mod atomic;
pub mod environment;
pub mod error;
pub mod fileops;
pub mod key;
pub mod layout;
pub mod maintenance;
pub mod manager;
pub mod manifest;
pub mod outputs;
pub mod stats;

pub use environment::EnvironmentFingerprint;
pub use error::{CacheError, ManifestError, Result};
pub use key::{compute_cache_key, CacheKey, CacheKeyInputs, InputFileHash};
pub use layout::CacheLayout;
pub use maintenance::{CleanResult, CorruptEntry, PruneResult, VerifyReport};
pub use manager::{
    CacheEntry, LookupOutcome, MissReason, RestoreResult, RestoredFile, SharedCache, StoreOutcome,
    StoreRequest,
};
pub use manifest::{CacheManifest, EntryDir, ManifestPath, OutputFileRecord};
pub use outputs::{OutputDetection, OutputDetector, Snapshot};
pub use stats::{format_bytes, CacheStatistics, StatisticsContext};
