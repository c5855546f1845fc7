//! # external-resources
//!
//! 外部资源映射存储：把 `corpus/document/text` 三段标识映射到
//! `provider,url`，并支持从（可 gzip 压缩的）CSV 文件批量导入。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │   BatchLoader (loader)          lookup (lookup)          │
//! │   CSV / gzip → 事务批次          三段标识 → 组合键 (key)  │
//! │        │ stage / commit               │ get              │
//! │        ▼                              ▼                  │
//! │   ┌──────────────────────────────────────────────────┐   │
//! │   │               MappingStore (store)               │   │
//! │   │   index : RwLock<HashMap>     并发点查             │   │
//! │   │   Transaction               大小受限，溢出即提交  │   │
//! │   │   CommitLog (commit_log)    CRC32 帧 + LZ4 负载   │   │
//! │   └──────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod common;
pub mod config;
pub mod compression;
pub mod commit_log;
pub mod key;
pub mod store;
pub mod loader;
pub mod lookup;

pub use common::{MappingError, Result};
pub use config::{KeyLayout, LoaderOptions, StoreOptions, ValueLayout};
pub use loader::{BatchLoader, LoadSummary};
pub use lookup::{lookup, LookupOutcome};
pub use store::{MappingStore, Transaction};
