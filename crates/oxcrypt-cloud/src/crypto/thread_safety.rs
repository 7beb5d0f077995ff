//! `Send` and `Sync` for [`MasterKey`].
//!
//! `MemSafe` holds a raw pointer to its protected page, which suppresses the
//! automatic impls. Every read of that page happens while holding the slot's
//! `RwLock`, and [`MasterKey::destroy`] takes the same lock before dropping the
//! container, so no thread can observe the pointer after it has been freed.

use super::keys::MasterKey;

// SAFETY: both key slots are `RwLock<Option<MemSafe<_>>>`; the pointer inside
// `MemSafe` is only dereferenced under the write lock, and mlock/mprotect are
// thread-safe system calls.
unsafe impl Send for MasterKey {}

// SAFETY: shared access goes exclusively through the `RwLock`s, see above.
unsafe impl Sync for MasterKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn master_key_is_send_and_sync() {
        assert_send_sync::<MasterKey>();
        assert_send_sync::<Arc<MasterKey>>();
    }

    #[test]
    fn concurrent_reads_and_destroy() {
        let key = Arc::new(MasterKey::random().expect("generate key"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let key = Arc::clone(&key);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    // Either a read succeeds or the key is already gone
                    let _ = key.with_aes_key(|k| k[0]);
                }
            }));
        }
        key.destroy();

        for handle in handles {
            handle.join().expect("thread completed");
        }
        assert!(key.is_destroyed());
    }
}
