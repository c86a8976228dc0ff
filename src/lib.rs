//! stratadb - a tiered buffer and memory manager for columnar
//! analytical query engines.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     query / codegen layer                       │
//! │        (external: parser, optimizer, JIT, result sets)          │
//! └───────────────┬─────────────────────────────┬───────────────────┘
//!                 │ chunks                      │ scratch memory
//! ┌───────────────▼───────────────┐ ┌───────────▼───────────────────┐
//! │           DataMgr             │ │      RowSetMemoryOwner        │
//! │  level 2: GPU   [per device]  │ │  arena + dictionary proxies   │
//! │  level 1: CPU   ─ promotion ↑ │ │  + tracked query outputs      │
//! │  level 0: DISK  ─ checkpoint ↓│ │  (one per query execution)    │
//! └───────────────┬───────────────┘ └───────────────────────────────┘
//!                 │
//! ┌───────────────▼─────────────────────────────────────────────────┐
//! │  Buffer (pages, dirty flags, epoch)  +  Encoder (statistics)    │
//! │  PageFile (durable chunk bytes)      +  chunk index             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (ChunkKey, MemoryLevel, Error, config)
//! - [`buffer`] - Page-structured buffers and pinned handles
//! - [`encoder`] - Fixed-width column encoders and chunk statistics
//! - [`storage`] - Durable page-file I/O
//! - [`mgr`] - Level buffer managers and the data manager
//! - [`rowset`] - Per-query arena and ownership
//!
//! # Quick Start
//! ```no_run
//! use stratadb::{ChunkKey, DataMgr, DataMgrConfig, EncodingSpec, MemoryLevel};
//!
//! let mgr = DataMgr::new(DataMgrConfig::default(), "data/").unwrap();
//!
//! // Ingest a column fragment at the disk level.
//! let key = ChunkKey::of_fragment(1, 1, 1, 0);
//! let chunk = mgr.create_chunk(MemoryLevel::Disk, &key, 4096).unwrap();
//! chunk.set_encoding(EncodingSpec::I32ToI16);
//! let values: Vec<u8> = [1i32, 2, 4].iter().flat_map(|v| v.to_ne_bytes()).collect();
//! let mut src: &[u8] = &values;
//! let metadata = chunk.append_encoded(&mut src, 3).unwrap();
//! assert_eq!(metadata.max, 4);
//! drop(chunk);
//!
//! // Persist, then read the chunk back through the CPU cache.
//! mgr.checkpoint().unwrap();
//! let cached = mgr.get_chunk(MemoryLevel::Cpu, &key, 0).unwrap();
//! assert_eq!(cached.used(), 6);
//! ```

pub mod buffer;
pub mod common;
pub mod encoder;
pub mod mgr;
pub mod rowset;
pub mod storage;

// Re-export commonly used items at the crate root.
pub use common::config::{DataMgrConfig, ARENA_MIN_ALLOC, DEFAULT_PAGE_SIZE};
pub use common::{ChunkKey, DeviceId, Error, MemoryLevel, Result};

pub use buffer::{Buffer, BufferEntry, Page, PinnedBuffer};
pub use encoder::{new_encoder, ChunkMetadata, Encoder, EncodingSpec};
pub use mgr::{CacheStats, CacheStatsSnapshot, DataMgr, DiskMgr, LevelBufferMgr, MemoryBufferMgr};
pub use rowset::{
    Arena, ArenaBuf, DictId, RowSetMemoryOwner, StringDictionary, StringDictionaryProxy,
    StringTranslationType, TranslationMap,
};
pub use storage::PageFile;
