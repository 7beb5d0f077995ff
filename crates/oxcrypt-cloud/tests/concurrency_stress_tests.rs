//! Stress tests sharing one filesystem view and one registry across threads.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p oxcrypt-cloud --features stress --test concurrency_stress_tests
//! ```

#![cfg(feature = "stress")]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use common::{PASSWORD, TestCloud, find_file, write_file};
use oxcrypt_cloud::CancelFlag;
use oxcrypt_cloud::cryptofs::{CryptoCloud, CryptoNode};

const THREADS: usize = 8;
const FILES_PER_THREAD: usize = 25;

#[test]
fn stress_parallel_writers_in_separate_folders() {
    let tc = TestCloud::new();
    let (_, fs) = tc.unlocked_vault();
    let root = fs.root();

    thread::scope(|scope| {
        for t in 0..THREADS {
            let fs = &fs;
            let root = &root;
            scope.spawn(move || {
                let folder = fs.create(&fs.folder(root, &format!("worker-{t}")).unwrap()).unwrap();
                for i in 0..FILES_PER_THREAD {
                    let content = format!("worker {t} file {i}");
                    write_file(fs, &folder, &format!("file-{i}.txt"), content.as_bytes());
                }
            });
        }
    });

    assert_eq!(fs.list(&root).unwrap().len(), THREADS);
    for t in 0..THREADS {
        let folder = fs.resolve(&format!("/worker-{t}")).unwrap();
        let listed = fs.list(&folder).unwrap();
        assert_eq!(listed.len(), FILES_PER_THREAD);
        for i in 0..FILES_PER_THREAD {
            let file = find_file(&listed, &format!("file-{i}.txt"));
            assert_eq!(
                fs.read_bytes(&file).unwrap(),
                format!("worker {t} file {i}").as_bytes()
            );
        }
    }
}

#[test]
fn stress_same_name_writers_never_overwrite() {
    let tc = TestCloud::new();
    let (_, fs) = tc.unlocked_vault();
    let root = fs.root();
    let failures = AtomicUsize::new(0);

    thread::scope(|scope| {
        for t in 0..THREADS {
            let (fs, root, failures) = (&fs, &root, &failures);
            scope.spawn(move || {
                for _ in 0..4 {
                    let file = fs.file(root, "contended.txt", None).unwrap();
                    // Losing a rename race surfaces as AlreadyExists.
                    if fs.write_bytes(&file, format!("{t}").as_bytes(), false).is_err() {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let listed = fs.list(&root).unwrap();
    let written = THREADS * 4 - failures.load(Ordering::Relaxed);
    assert_eq!(listed.len(), written);
    for node in &listed {
        let CryptoNode::File(file) = node else {
            panic!("unexpected node {}", node.name());
        };
        assert!(!fs.read_bytes(file).unwrap().is_empty());
    }
}

#[test]
fn stress_lock_unlock_churn_with_readers() {
    let tc = TestCloud::new();
    let (vault, fs) = tc.unlocked_vault();
    let file = write_file(&fs, &fs.root(), "read-me.txt", b"stable content");
    let fs = Arc::new(fs);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let fs = Arc::clone(&fs);
            let file = file.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    // Either a consistent read or a clean MissingCryptor, never garbage.
                    if let Ok(content) = fs.read_bytes(&file) {
                        assert_eq!(content, b"stable content");
                    }
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..20 {
                let locked = tc.provider.lock(&vault);
                tc.provider
                    .unlock(&locked, PASSWORD, &CancelFlag::new())
                    .unwrap();
            }
        });
    });

    assert_eq!(tc.registry.len(), 1);
    let fresh = CryptoCloud::new(&vault, Arc::clone(&tc.cloud), &tc.registry).unwrap();
    assert_eq!(fresh.read_bytes(&file).unwrap(), b"stable content");
}
