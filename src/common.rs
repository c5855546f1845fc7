//! 全局基础常量与错误定义

use std::path::PathBuf;
use thiserror::Error;

// ── 常量 ──────────────────────────────────────────────────────────────────────

/// 组合键分隔符：corpus / document / text
pub const KEY_DELIMITER: char = '/';

/// value 字段之间的分隔符（provider,url）
pub const VALUE_SEPARATOR: char = ',';

/// 未命中时由外层传输渲染的固定响应体
pub const NOT_FOUND_BODY: &str = "No entry found";

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot open store at {path}: {reason}")]
    StoreOpen { path: PathBuf, reason: String },
    #[error("malformed record at line {line}: {reason}")]
    RecordDecode { line: u64, reason: String },
    #[error("transaction too big")]
    TransactionOverflow,
    #[error("entry too large for a single transaction: key={key} size={size} limit={limit}")]
    EntryTooLarge { key: String, size: usize, limit: usize },
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("key segment contains reserved delimiter: {0:?}")]
    InvalidSegment(String),
    #[error("checksum mismatch in commit frame at offset {offset}")]
    ChecksumMismatch { offset: u64 },
    #[error("compression error: {0}")]
    Compression(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MappingError {
    pub(crate) fn open(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::StoreOpen { path: path.into(), reason: reason.to_string() }
    }

    pub(crate) fn decode(line: u64, reason: impl std::fmt::Display) -> Self {
        Self::RecordDecode { line, reason: reason.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, MappingError>;
