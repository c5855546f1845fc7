//! 映射存储（Mapping Store）
//!
//! ```text
//!  MappingStore (Clone, Arc 共享句柄)
//!   ├─ index : RwLock<HashMap<key, value>>   读路径，多读不互斥
//!   ├─ log   : Mutex<CommitLog>              写路径，只在 commit 时串行
//!   └─ slot  : 目录槽位，持有 LOCK 独占锁（fs2）
//! ```
//!
//! 进程内注册表为每个目录保留一个槽位。同目录的 open 在槽位上串行，
//! 不同目录互不阻塞；目录锁归槽位所有，最后一个引擎释放且没有新引擎
//! 接手时才解锁。
//!
//! 写入只经由 [`Transaction`]：stage 在事务本地暂存，commit 时整帧追加到
//! 提交日志，再一次性应用到内存索引。

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::commit_log::{CommitLog, Entry, LOG_FILE_NAME};
use crate::common::{MappingError, Result};
use crate::config::{StoreOptions, MAX_TXN_BYTES_LIMIT};

const LOCK_FILE_NAME: &str = "LOCK";

/// 每个条目在事务预算中额外计入的字节（key/value 两个长度前缀）
const ENTRY_OVERHEAD: usize = 8;

// ── 进程内句柄注册表 ──────────────────────────────────────────────────────────

/// 一个目录的打开槽位
#[derive(Default)]
struct DirSlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    /// 当前引擎；同一目录重复 open 复用它
    store:     Weak<StoreInner>,
    /// 目录锁；跨越引擎的交接保持持有
    lock_file: Option<File>,
}

/// 规范化目录 → 槽位；全局锁只在查找槽位时持有
fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<DirSlot>>> {
    static OPEN_STORES: OnceLock<Mutex<HashMap<PathBuf, Arc<DirSlot>>>> = OnceLock::new();
    OPEN_STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock_directory(dir: &Path) -> Result<File> {
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(dir.join(LOCK_FILE_NAME))
        .map_err(|e| MappingError::open(dir, e))?;
    lock_file.try_lock_exclusive()
        .map_err(|e| MappingError::open(dir, format!("directory is locked: {e}")))?;
    Ok(lock_file)
}

// ── 存储内部状态 ──────────────────────────────────────────────────────────────

struct StoreInner {
    dir:       PathBuf,
    options:   StoreOptions,
    index:     RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    log:       Mutex<CommitLog>,
    slot:      Arc<DirSlot>,
}

impl StoreInner {
    /// 调用方已持有 `slot` 的状态锁和目录锁
    fn open(dir: PathBuf, mut options: StoreOptions, slot: Arc<DirSlot>) -> Result<Self> {
        options.max_txn_bytes = options.max_txn_bytes.min(MAX_TXN_BYTES_LIMIT);

        let mut index = HashMap::new();
        let log = CommitLog::open(&dir.join(LOG_FILE_NAME), |batch| {
            for (k, v) in batch {
                index.insert(k, v);
            }
        })
        .map_err(|e| match e {
            e @ MappingError::StoreOpen { .. } => e,
            other => MappingError::open(&dir, other),
        })?;

        info!(dir = %dir.display(), keys = index.len(), log_bytes = log.size(),
            "mapping store opened");

        Ok(Self {
            dir, options,
            index: RwLock::new(index),
            log:   Mutex::new(log),
            slot,
        })
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Err(e) = self.log.get_mut().sync() {
            warn!(dir = %self.dir.display(), error = %e, "failed to sync commit log on close");
        }
        let mut state = self.slot.state.lock();
        // 已有新引擎接手时锁随槽位留给它
        if state.store.strong_count() == 0 {
            if let Some(lock_file) = state.lock_file.take() {
                if let Err(e) = lock_file.unlock() {
                    warn!(dir = %self.dir.display(), error = %e, "failed to release directory lock");
                }
            }
        }
        drop(state);
        info!(dir = %self.dir.display(), "mapping store closed");
    }
}

// ── 统计 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub keys:      usize,
    pub frames:    u64,
    pub log_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub entries: usize,
    /// 追加到日志的帧字节数；空提交为 0
    pub bytes:   u64,
}

// ── MappingStore 句柄 ─────────────────────────────────────────────────────────

/// 映射存储句柄；clone 共享同一个引擎
#[derive(Clone)]
pub struct MappingStore(Arc<StoreInner>);

impl MappingStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(dir, StoreOptions::default())
    }

    /// 打开或创建存储目录
    ///
    /// 同一目录已有存活句柄时直接返回该句柄，`options` 被忽略。
    pub fn open_with(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| MappingError::open(dir, e))?;
        let dir = dir.canonicalize().map_err(|e| MappingError::open(dir, e))?;

        let slot = {
            let mut slots = registry().lock();
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(dir.clone()).or_default())
        };

        let mut state = slot.state.lock();
        if let Some(inner) = state.store.upgrade() {
            debug!(dir = %dir.display(), "store already open, sharing handle");
            return Ok(Self(inner));
        }
        // 上一个引擎可能仍在释放中，此时沿用它留下的目录锁
        if state.lock_file.is_none() {
            state.lock_file = Some(lock_directory(&dir)?);
        }

        match StoreInner::open(dir, options, Arc::clone(&slot)) {
            Ok(inner) => {
                let inner = Arc::new(inner);
                state.store = Arc::downgrade(&inner);
                Ok(Self(inner))
            }
            Err(e) => {
                state.lock_file = None;
                Err(e)
            }
        }
    }

    /// 同步日志并释放本句柄；最后一个句柄释放时解除目录锁
    pub fn close(self) -> Result<()> {
        let mut log = self.0.log.lock();
        log.sync()
    }

    // ── 读 ────────────────────────────────────────────────────────────────────

    /// 点查；未命中返回 None
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.index.read().get(key).cloned()
    }

    pub fn len(&self) -> usize { self.0.index.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn dir(&self) -> &Path { &self.0.dir }
    pub fn options(&self) -> &StoreOptions { &self.0.options }

    pub fn stats(&self) -> StoreStats {
        let log = self.0.log.lock();
        StoreStats {
            keys:      self.len(),
            frames:    log.frames(),
            log_bytes: log.size(),
        }
    }

    // ── 写 ────────────────────────────────────────────────────────────────────

    pub fn begin_transaction(&self) -> Transaction {
        Transaction { store: self.clone(), pending: Vec::new(), pending_bytes: 0 }
    }

    /// 单条写入（一条目的事务）
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut txn = self.begin_transaction();
        txn.stage(key, value)?;
        txn.commit().map(|_| ())
    }

    /// 重写提交日志，只保留每个 key 的当前值
    pub fn compact(&self) -> Result<StoreStats> {
        let inner = &self.0;
        let mut log = inner.log.lock();
        let before  = log.size();
        {
            let index = inner.index.read();
            let live  = index.iter().map(|(k, v)| (k.as_slice(), v.as_slice()));
            log.rewrite(
                live,
                inner.options.compression,
                inner.options.max_txn_entries,
                inner.options.max_txn_bytes,
            )?;
        }
        info!(dir = %inner.dir.display(), before, after = log.size(), "commit log compacted");
        Ok(StoreStats {
            keys:      inner.index.read().len(),
            frames:    log.frames(),
            log_bytes: log.size(),
        })
    }
}

impl std::fmt::Debug for MappingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingStore").field("dir", &self.0.dir).finish()
    }
}

// ── Transaction ───────────────────────────────────────────────────────────────

/// 写事务；未 commit 直接 drop 即丢弃
pub struct Transaction {
    store:         MappingStore,
    pending:       Vec<Entry>,
    pending_bytes: usize,
}

impl Transaction {
    /// 暂存一条写入
    ///
    /// 超出事务预算时返回 [`MappingError::TransactionOverflow`]，该条目不会被暂存；
    /// 空事务也放不下的条目返回 [`MappingError::EntryTooLarge`]。
    pub fn stage(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let opts = &self.store.0.options;
        let size = key.len() + value.len() + ENTRY_OVERHEAD;
        let over_entries = self.pending.len() + 1 > opts.max_txn_entries.max(1);
        let over_bytes   = self.pending_bytes + size > opts.max_txn_bytes;

        if over_entries || over_bytes {
            if self.pending.is_empty() {
                return Err(MappingError::EntryTooLarge {
                    key:   String::from_utf8_lossy(key).into_owned(),
                    size,
                    limit: opts.max_txn_bytes,
                });
            }
            return Err(MappingError::TransactionOverflow);
        }

        self.pending.push((key.to_vec(), value.to_vec()));
        self.pending_bytes += size;
        Ok(())
    }

    /// 原子提交：整帧落盘后再对读者可见
    pub fn commit(self) -> Result<CommitStats> {
        let inner   = &self.store.0;
        let entries = self.pending.len();
        if entries == 0 {
            debug!("empty commit");
            return Ok(CommitStats::default());
        }

        let mut log = inner.log.lock();
        let bytes = log
            .append(&self.pending, inner.options.compression, inner.options.sync_on_commit)
            .map_err(|e| match e {
                e @ MappingError::Commit(_) => e,
                other => MappingError::Commit(other.to_string()),
            })?;

        let mut index = inner.index.write();
        for (k, v) in self.pending {
            index.insert(k, v);
        }
        drop(index);
        drop(log);

        debug!(entries, bytes, "transaction committed");
        Ok(CommitStats { entries, bytes })
    }

    pub fn len(&self) -> usize { self.pending.len() }
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
    pub fn staged_bytes(&self) -> usize { self.pending_bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_none() {
        let dir   = tempfile::tempdir().unwrap();
        let store = MappingStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"U92/JAN/00002"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn put_overwrites_existing_key() {
        let dir   = tempfile::tempdir().unwrap();
        let store = MappingStore::open(dir.path()).unwrap();
        store.put(b"s11/s12/s13", b"sueddeutsche,http://example.org").unwrap();
        store.put(b"s11/s12/s13", b"sueddeutsche,http://example.com").unwrap();
        assert_eq!(store.get(b"s11/s12/s13").unwrap(), b"sueddeutsche,http://example.com");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn second_open_shares_the_live_handle() {
        let dir = tempfile::tempdir().unwrap();
        let a   = MappingStore::open(dir.path()).unwrap();
        let b   = MappingStore::open(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&a.0, &b.0));

        a.put(b"k", b"v").unwrap();
        assert_eq!(b.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn locked_directory_fails_to_open() {
        let dir  = tempfile::tempdir().unwrap();
        let lock = OpenOptions::new()
            .read(true).write(true).create(true)
            .open(dir.path().join(LOCK_FILE_NAME))
            .unwrap();
        lock.try_lock_exclusive().unwrap();

        let err = MappingStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, MappingError::StoreOpen { .. }));
    }

    #[test]
    fn failed_open_releases_directory_lock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOG_FILE_NAME), b"definitely not a log").unwrap();
        assert!(matches!(MappingStore::open(dir.path()), Err(MappingError::StoreOpen { .. })));

        std::fs::remove_file(dir.path().join(LOG_FILE_NAME)).unwrap();
        let store = MappingStore::open(dir.path()).unwrap();
        store.put(b"k", b"v").unwrap();
    }

    #[test]
    fn open_is_not_blocked_by_another_directory() {
        let busy  = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();

        // 模拟另一目录正在重放：占住它的槽位
        let slot = {
            let key = busy.path().canonicalize().unwrap();
            Arc::clone(registry().lock().entry(key).or_default())
        };
        let _replaying = slot.state.lock();

        let store = MappingStore::open(other.path()).unwrap();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn corrupted_frame_header_fails_open_and_keeps_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MappingStore::open(dir.path()).unwrap();
            store.put(b"a", b"p,1").unwrap();
            store.put(b"b", b"p,2").unwrap();
            store.put(b"c", b"p,3").unwrap();
            store.close().unwrap();
        }

        // 第一帧 payload_len 的最高字节
        let path = dir.path().join(LOG_FILE_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        let len_before = bytes.len() as u64;
        bytes[15] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = MappingStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, MappingError::StoreOpen { .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);
    }

    #[test]
    fn oversized_byte_budget_is_capped_on_open() {
        let dir  = tempfile::tempdir().unwrap();
        let mut opts = StoreOptions::default();
        opts.max_txn_bytes = usize::MAX;
        let store = MappingStore::open_with(dir.path(), opts).unwrap();
        assert_eq!(store.options().max_txn_bytes, MAX_TXN_BYTES_LIMIT);
    }

    #[test]
    fn reopen_replays_committed_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MappingStore::open(dir.path()).unwrap();
            let mut txn = store.begin_transaction();
            txn.stage(b"U92/JAN/00001", b"Zeitung,http://a").unwrap();
            txn.stage(b"U92/JAN/00003", b"Zeitung,http://b").unwrap();
            txn.commit().unwrap();
            store.close().unwrap();
        }
        let store = MappingStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"U92/JAN/00001").unwrap(), b"Zeitung,http://a");
        assert_eq!(store.get(b"U92/JAN/00003").unwrap(), b"Zeitung,http://b");
    }

    #[test]
    fn uncommitted_transaction_is_discarded() {
        let dir   = tempfile::tempdir().unwrap();
        let store = MappingStore::open(dir.path()).unwrap();
        let mut txn = store.begin_transaction();
        txn.stage(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k"), None);
        drop(txn);
        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.stats().frames, 0);
    }

    #[test]
    fn stage_overflows_at_entry_budget() {
        let dir   = tempfile::tempdir().unwrap();
        let opts  = StoreOptions::default().with_max_txn_entries(2);
        let store = MappingStore::open_with(dir.path(), opts).unwrap();

        let mut txn = store.begin_transaction();
        txn.stage(b"a", b"1").unwrap();
        txn.stage(b"b", b"2").unwrap();
        assert!(matches!(txn.stage(b"c", b"3"), Err(MappingError::TransactionOverflow)));
        assert_eq!(txn.len(), 2);

        let stats = txn.commit().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(store.get(b"c"), None);
    }

    #[test]
    fn stage_overflows_at_byte_budget() {
        let dir   = tempfile::tempdir().unwrap();
        let opts  = StoreOptions::default().with_max_txn_bytes(30);
        let store = MappingStore::open_with(dir.path(), opts).unwrap();

        let mut txn = store.begin_transaction();
        txn.stage(b"key1", b"value1").unwrap(); // 18
        assert!(matches!(txn.stage(b"key2", b"value2"), Err(MappingError::TransactionOverflow)));
        assert_eq!(txn.staged_bytes(), 18);
    }

    #[test]
    fn oversized_entry_is_rejected_by_empty_transaction() {
        let dir   = tempfile::tempdir().unwrap();
        let opts  = StoreOptions::default().with_max_txn_bytes(16);
        let store = MappingStore::open_with(dir.path(), opts).unwrap();

        let err = store.put(b"U92/JAN/00001", b"a very long provider label").unwrap_err();
        assert!(matches!(err, MappingError::EntryTooLarge { limit: 16, .. }));
    }

    #[test]
    fn empty_commit_writes_nothing() {
        let dir   = tempfile::tempdir().unwrap();
        let store = MappingStore::open(dir.path()).unwrap();
        let stats = store.begin_transaction().commit().unwrap();
        assert_eq!(stats, CommitStats::default());
        assert_eq!(store.stats().frames, 0);
    }

    #[test]
    fn compact_drops_overwritten_versions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MappingStore::open(dir.path()).unwrap();
            for i in 0..50 {
                store.put(b"k", format!("provider,http://x/{i}").as_bytes()).unwrap();
            }
            store.put(b"other", b"p,u").unwrap();
            let before = store.stats();
            let after  = store.compact().unwrap();
            assert_eq!(after.keys, 2);
            assert!(after.log_bytes < before.log_bytes);
            assert_eq!(after.frames, 1);

            store.put(b"late", b"p,late").unwrap();
        }
        let store = MappingStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(b"k").unwrap(), b"provider,http://x/49");
        assert_eq!(store.get(b"late").unwrap(), b"p,late");
    }
}
