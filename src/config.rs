//! 存储引擎与导入器的配置项

use crate::compression::CompressionType;

// ── StoreOptions ──────────────────────────────────────────────────────────────

/// 单个事务的默认字节上限（key + value + 帧内开销）
pub const DEFAULT_MAX_TXN_BYTES: usize = 8 * 1024 * 1024;
/// 单个事务的默认条目上限
pub const DEFAULT_MAX_TXN_ENTRIES: usize = 100_000;
/// 事务字节预算的硬上限：一帧的长度字段为 u32，LZ4 块接口为 i32
pub const MAX_TXN_BYTES_LIMIT: usize = i32::MAX as usize;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// 超过该字节数时 stage 返回 TransactionOverflow；打开存储时截到 [`MAX_TXN_BYTES_LIMIT`]
    pub max_txn_bytes:   usize,
    /// 超过该条目数时 stage 返回 TransactionOverflow
    pub max_txn_entries: usize,
    /// 提交帧负载压缩方式
    pub compression:     CompressionType,
    /// 每次 commit 后 fsync 日志文件
    pub sync_on_commit:  bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_txn_bytes:   DEFAULT_MAX_TXN_BYTES,
            max_txn_entries: DEFAULT_MAX_TXN_ENTRIES,
            compression:     CompressionType::Lz4,
            sync_on_commit:  true,
        }
    }
}

impl StoreOptions {
    /// 超过 [`MAX_TXN_BYTES_LIMIT`] 的值按上限处理
    pub fn with_max_txn_bytes(mut self, bytes: usize) -> Self {
        self.max_txn_bytes = bytes.min(MAX_TXN_BYTES_LIMIT); self
    }
    pub fn with_max_txn_entries(mut self, entries: usize) -> Self {
        self.max_txn_entries = entries; self
    }
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.compression = comp; self
    }
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync; self
    }
}

// ── LoaderOptions ─────────────────────────────────────────────────────────────

/// 记录中构成 key 的列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// 第 0 列即完整的组合键（`U92/JAN/00001`）
    Composite,
    /// 第 0..3 列分别为 corpus / document / text
    Split,
}

impl KeyLayout {
    pub fn key_fields(self) -> usize {
        match self {
            Self::Composite => 1,
            Self::Split     => 3,
        }
    }
}

/// 记录中 key 之后的 value 列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLayout {
    /// provider, url
    ProviderUrl,
    /// 仅 url
    UrlOnly,
}

impl ValueLayout {
    pub fn min_value_fields(self) -> usize {
        match self {
            Self::ProviderUrl => 2,
            Self::UrlOnly     => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub delimiter:    u8,
    pub key_layout:   KeyLayout,
    pub value_layout: ValueLayout,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            delimiter:    b',',
            key_layout:   KeyLayout::Composite,
            value_layout: ValueLayout::ProviderUrl,
        }
    }
}

impl LoaderOptions {
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter; self
    }
    pub fn with_key_layout(mut self, layout: KeyLayout) -> Self {
        self.key_layout = layout; self
    }
    pub fn with_value_layout(mut self, layout: ValueLayout) -> Self {
        self.value_layout = layout; self
    }

    /// 一条记录至少需要的列数
    pub fn min_fields(&self) -> usize {
        self.key_layout.key_fields() + self.value_layout.min_value_fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_byte_budget_is_capped() {
        let opts = StoreOptions::default().with_max_txn_bytes(usize::MAX);
        assert_eq!(opts.max_txn_bytes, MAX_TXN_BYTES_LIMIT);

        let opts = StoreOptions::default().with_max_txn_bytes(4096);
        assert_eq!(opts.max_txn_bytes, 4096);
    }

    #[test]
    fn loader_field_count_follows_layouts() {
        let opts = LoaderOptions::default()
            .with_key_layout(KeyLayout::Split)
            .with_value_layout(ValueLayout::UrlOnly);
        assert_eq!(opts.min_fields(), 4);
        assert_eq!(LoaderOptions::default().min_fields(), 3);
    }
}
