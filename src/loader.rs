//! 批量导入（Batch Loader）
//!
//! 从 CSV（可选 gzip）逐条读取记录，驱动存储做一串大小受限的事务：
//!
//! ```text
//!  record ──► stage ──ok──► 下一条
//!               │
//!            overflow ──► commit 当前事务 ──► 新事务 ──► 重新 stage 同一条
//!
//!  EOF ──► commit 最后一个（可能为空的）事务
//! ```
//!
//! 任一记录格式错误即中止整个导入；此前已提交的事务保持提交状态。

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tracing::{debug, info};

use crate::common::{MappingError, Result};
use crate::config::{KeyLayout, LoaderOptions};
use crate::key::{join_value, CompositeKey};
use crate::store::MappingStore;

/// 视为 gzip 压缩的文件扩展名
pub const GZIP_EXTENSIONS: &[&str] = &["gz", "csvz"];

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| GZIP_EXTENSIONS.iter().any(|g| ext.eq_ignore_ascii_case(g)))
        .unwrap_or(false)
}

/// 一次导入的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// 成功 stage 的记录数
    pub records: u64,
    /// 提交次数（溢出边界 + 最终提交）
    pub commits: u64,
    /// 写入日志的帧字节数
    pub bytes:   u64,
}

pub struct BatchLoader<'a> {
    store:   &'a MappingStore,
    options: LoaderOptions,
}

impl<'a> BatchLoader<'a> {
    pub fn new(store: &'a MappingStore) -> Self {
        Self { store, options: LoaderOptions::default() }
    }

    pub fn with_options(mut self, options: LoaderOptions) -> Self {
        self.options = options; self
    }

    /// 按扩展名选择 gzip 或明文后导入文件
    pub fn load_path(&self, path: impl AsRef<Path>) -> Result<LoadSummary> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if is_gzip_path(path) {
            debug!(path = %path.display(), "reading gzip input");
            self.load(MultiGzDecoder::new(file))
        } else {
            self.load(file)
        }
    }

    /// 从已解压的字节流导入
    pub fn load<R: Read>(&self, input: R) -> Result<LoadSummary> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.options.delimiter)
            .from_reader(input);

        let mut summary        = LoadSummary::default();
        let mut since_boundary = 0u64;
        let mut record         = csv::StringRecord::new();
        let mut txn            = self.store.begin_transaction();

        loop {
            match reader.read_record(&mut record) {
                Ok(true)  => {}
                Ok(false) => break,
                Err(e) => {
                    let line = e.position().map_or(summary.records + 1, |p| p.line());
                    return Err(MappingError::decode(line, e));
                }
            }
            let line = record.position().map_or(summary.records + 1, |p| p.line());
            let (key, value) = self.build_entry(&record, line)?;

            match txn.stage(key.as_bytes(), &value) {
                Ok(()) => {}
                Err(MappingError::TransactionOverflow) => {
                    let stats = txn.commit()?;
                    summary.commits += 1;
                    summary.bytes   += stats.bytes;
                    info!(key = %key, records = since_boundary, "commit boundary");

                    since_boundary = 0;
                    txn = self.store.begin_transaction();
                    txn.stage(key.as_bytes(), &value)?;
                }
                Err(e) => return Err(e),
            }
            since_boundary  += 1;
            summary.records += 1;
        }

        let stats = txn.commit()?;
        summary.commits += 1;
        summary.bytes   += stats.bytes;

        info!(records = summary.records, commits = summary.commits, bytes = summary.bytes,
            "load finished");
        Ok(summary)
    }

    /// 记录 → (组合键, `provider,url`)
    fn build_entry(&self, record: &csv::StringRecord, line: u64) -> Result<(CompositeKey, Vec<u8>)> {
        let min = self.options.min_fields();
        if record.len() < min {
            return Err(MappingError::decode(
                line,
                format!("expected at least {min} fields, got {}", record.len()),
            ));
        }

        let key = match self.options.key_layout {
            KeyLayout::Composite => CompositeKey::from_raw(&record[0]),
            KeyLayout::Split => CompositeKey::new(&record[0], &record[1], &record[2])
                .map_err(|e| MappingError::decode(line, e))?,
        };
        let value = join_value(record.iter().skip(self.options.key_layout.key_fields()));
        Ok((key, value))
    }
}
