//! Concurrent lookups against a shared store handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use external_resources::{lookup, BatchLoader, LookupOutcome, MappingStore, StoreOptions};
use tempfile::TempDir;

#[test]
fn test_readers_run_alongside_loader() {
    let dir   = TempDir::new().unwrap();
    let opts  = StoreOptions::default()
        .with_max_txn_entries(100)
        .with_sync_on_commit(false);
    let store = MappingStore::open_with(dir.path(), opts).unwrap();
    store.put(b"U92/JAN/00001", b"Zeitung,http://a").unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let done  = Arc::clone(&done);
            thread::spawn(move || {
                let mut lookups = 0u64;
                loop {
                    // 预先写入的条目在整个导入期间始终可见
                    assert_eq!(
                        lookup(&store, "U92", "JAN", "00001"),
                        LookupOutcome::Hit(b"Zeitung,http://a".to_vec())
                    );
                    assert_eq!(lookup(&store, "U92", "JAN", "00002"), LookupOutcome::Miss);
                    lookups += 1;
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                }
                lookups
            })
        })
        .collect();

    let input: String = (0..5_000)
        .map(|i| format!("BULK/DOC/{i:05},provider,http://bulk/{i}\n"))
        .collect();
    let summary = BatchLoader::new(&store).load(input.as_bytes()).unwrap();
    done.store(true, Ordering::Release);

    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
    assert_eq!(summary.records, 5_000);
    assert_eq!(summary.commits, 50);
    assert_eq!(store.len(), 5_001);
}

#[test]
fn test_handles_share_one_engine_across_threads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let path = path.clone();
            thread::spawn(move || {
                // 每个线程各自 open，同一目录得到同一个引擎
                let store = MappingStore::open(&path).unwrap();
                for i in 0..25 {
                    let key = format!("T{t}/DOC/{i:05}");
                    store.put(key.as_bytes(), b"p,u").unwrap();
                }
                store
            })
        })
        .collect();

    let stores: Vec<MappingStore> = writers.into_iter().map(|w| w.join().unwrap()).collect();
    for store in &stores {
        assert_eq!(store.len(), 100);
    }
    for store in stores {
        store.close().unwrap();
    }

    let reopened = MappingStore::open(&path).unwrap();
    assert_eq!(reopened.len(), 100);
}

#[test]
fn test_open_races_with_last_handle_drop() {
    let dir  = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    for round in 0..300 {
        let first  = MappingStore::open(&path).unwrap();
        let path2  = path.clone();
        let opener = thread::spawn(move || MappingStore::open(&path2));
        // 与另一线程的 open 竞争释放最后一个句柄
        drop(first);

        let second = opener
            .join()
            .unwrap()
            .unwrap_or_else(|e| panic!("round {round}: open failed while directory was free: {e}"));
        drop(second);
    }

    let store = MappingStore::open(&path).unwrap();
    store.put(b"k", b"v").unwrap();
    assert_eq!(store.len(), 1);
}
