//! # Non-volatile store façade
//!
//! A single-namespace key → blob store backed by an `sled` tree. Writes land
//! in sled's page cache immediately (so `get` sees them) but only reach disk
//! on [`Nvs::commit`]; automatic background flushing is disabled when the
//! database is opened.
//!
//! ## Stability timer
//!
//! `open` creates a one-shot timer named `MESHX_COMMIT_TIMER`. Every write
//! made with `arm = true` restarts it, so a burst of armed writes costs one
//! commit once the store has been quiet for the whole window. Unarmed writes
//! stay uncommitted until an explicit `commit` or a later armed write. A
//! window of `0` disables the timer.
//!
//! ## Lifecycle
//!
//! ```text
//! init -> open -> (set | get | remove | erase | commit)* -> close -> open ...
//! ```
//!
//! Opening twice, or touching the store while it is closed, returns
//! `InvalidState`.
//!
//! ## Product identity
//!
//! The namespace carries `MESHX_CID` and `MESHX_PID`. When either is missing
//! or differs from the ids passed to `open`, the persisted contents belong to
//! another firmware image and the namespace is wiped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MeshxError, Result};
use crate::os::{OsTimer, TimerService};

pub const NAMESPACE: &str = "MESHX_NVS";
pub const KEY_CID: &str = "MESHX_CID";
pub const KEY_PID: &str = "MESHX_PID";
pub const COMMIT_TIMER_NAME: &str = "MESHX_COMMIT_TIMER";
/// Longest key the namespace accepts.
pub const KEY_MAX_LEN: usize = 15;

/// Key under which an element persists its context.
pub fn element_ctx_key(element_id: u16) -> String {
    format!("MESHX_EL_{:04x}", element_id)
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > KEY_MAX_LEN {
        return Err(MeshxError::invalid_arg(format!(
            "nvs key '{}' must be 1..={} bytes",
            key, KEY_MAX_LEN
        )));
    }
    Ok(())
}

struct OpenStore {
    db: sled::Db,
    tree: sled::Tree,
    timer: Option<OsTimer>,
}

struct NvsInner {
    root: PathBuf,
    timers: TimerService,
    state: Mutex<Option<OpenStore>>,
    commits: AtomicU64,
    #[cfg(test)]
    commit_threads: Mutex<Vec<std::thread::ThreadId>>,
}

impl NvsInner {
    fn lock(&self) -> MutexGuard<'_, Option<OpenStore>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flush with the state lock released; the flush blocks on disk I/O.
    fn commit(&self) -> Result<()> {
        let db = self
            .lock()
            .as_ref()
            .map(|store| store.db.clone())
            .ok_or_else(|| MeshxError::invalid_state("nvs not open"))?;
        let bytes = db.flush()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        #[cfg(test)]
        self.commit_threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(std::thread::current().id());
        debug!(target: "meshx::nvs", "commit flushed {} bytes", bytes);
        Ok(())
    }
}

/// Handle to the NVS namespace. Clones share the same store.
#[derive(Clone)]
pub struct Nvs {
    inner: Arc<NvsInner>,
}

impl Nvs {
    /// One-time initialization: prepare the platform directory under `root`.
    pub fn init(root: impl Into<PathBuf>, timers: TimerService) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(NvsInner {
                root,
                timers,
                state: Mutex::new(None),
                commits: AtomicU64::new(0),
                #[cfg(test)]
                commit_threads: Mutex::default(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Number of commits performed since `init`, explicit or timer-driven.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Open the namespace and arm the product identity check.
    pub fn open(&self, cid: u16, pid: u16, stability_ms: u32) -> Result<()> {
        {
            let mut guard = self.inner.lock();
            if guard.is_some() {
                return Err(MeshxError::invalid_state("nvs already open"));
            }

            let db = sled::Config::new()
                .path(&self.inner.root)
                .flush_every_ms(None)
                .open()?;
            let tree = db.open_tree(NAMESPACE)?;

            let timer = if stability_ms == 0 {
                None
            } else {
                let weak: Weak<NvsInner> = Arc::downgrade(&self.inner);
                let timer = self.inner.timers.create(
                    COMMIT_TIMER_NAME,
                    Duration::from_millis(u64::from(stability_ms)),
                    false,
                    Arc::new(move |_name: &str| {
                        let Some(inner) = weak.upgrade() else { return };
                        // timer callbacks run on a runtime worker
                        tokio::task::spawn_blocking(move || {
                            if let Err(e) = inner.commit() {
                                error!(target: "meshx::nvs", "stability commit failed: {}", e);
                            }
                        });
                    }),
                )?;
                Some(timer)
            };

            *guard = Some(OpenStore { db, tree, timer });
        }
        info!(
            target: "meshx::nvs",
            "opened {} at {} (stability {} ms)",
            NAMESPACE,
            self.inner.root.display(),
            stability_ms
        );
        self.check_product_identity(cid, pid)
    }

    fn check_product_identity(&self, cid: u16, pid: u16) -> Result<()> {
        let stored_cid = self.get_value::<u16>(KEY_CID).ok();
        let stored_pid = self.get_value::<u16>(KEY_PID).ok();
        if stored_cid == Some(cid) && stored_pid == Some(pid) {
            return Ok(());
        }
        warn!(
            target: "meshx::nvs",
            "product identity changed (cid {:?} -> 0x{:04x}, pid {:?} -> 0x{:04x}); erasing namespace",
            stored_cid, cid, stored_pid, pid
        );
        self.erase()?;
        self.set_value(KEY_PID, &pid, false)?;
        self.set_value(KEY_CID, &cid, true)
    }

    fn with_open<R>(&self, f: impl FnOnce(&OpenStore) -> Result<R>) -> Result<R> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(store) => f(store),
            None => Err(MeshxError::invalid_state("nvs not open")),
        }
    }

    /// Write `blob` under `key`; with `arm` the stability window restarts.
    pub fn set(&self, key: &str, blob: &[u8], arm: bool) -> Result<()> {
        check_key(key)?;
        self.with_open(|store| {
            if arm {
                if let Some(timer) = &store.timer {
                    timer.reset()?;
                }
            }
            store.tree.insert(key.as_bytes(), blob)?;
            Ok(())
        })
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        self.with_open(|store| match store.tree.get(key.as_bytes())? {
            Some(v) => Ok(v.to_vec()),
            None => Err(MeshxError::NotFound(key.to_string())),
        })
    }

    /// Read `key` into `buf`, which must match the stored length exactly.
    pub fn get_into(&self, key: &str, buf: &mut [u8]) -> Result<()> {
        let value = self.get(key)?;
        if value.len() != buf.len() {
            return Err(MeshxError::SizeMismatch {
                stored: value.len(),
                buffer: buf.len(),
            });
        }
        buf.copy_from_slice(&value);
        Ok(())
    }

    pub fn set_value<T: Serialize>(&self, key: &str, value: &T, arm: bool) -> Result<()> {
        let blob = bincode::serialize(value)?;
        self.set(key, &blob, arm)
    }

    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let blob = self.get(key)?;
        Ok(bincode::deserialize(&blob)?)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.with_open(|store| match store.tree.remove(key.as_bytes())? {
            Some(_) => Ok(()),
            None => Err(MeshxError::NotFound(key.to_string())),
        })
    }

    /// Remove every key in the namespace.
    pub fn erase(&self) -> Result<()> {
        self.with_open(|store| {
            store.tree.clear()?;
            Ok(())
        })
    }

    /// Flush buffered writes now.
    pub fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    /// Delete the stability timer and release the underlying database.
    /// Uncommitted writes are not flushed here.
    pub fn close(&self) -> Result<()> {
        let store = self
            .inner
            .lock()
            .take()
            .ok_or_else(|| MeshxError::invalid_state("nvs not open"))?;
        if let Some(timer) = &store.timer {
            if let Err(e) = timer.delete() {
                debug!(target: "meshx::nvs", "commit timer already gone: {}", e);
            }
        }
        drop(store);
        info!(target: "meshx::nvs", "closed {}", NAMESPACE);
        Ok(())
    }

    /// Persist an element context with the stability timer armed.
    pub fn element_ctx_set<T: Serialize>(&self, element_id: u16, ctx: &T) -> Result<()> {
        self.set_value(&element_ctx_key(element_id), ctx, true)
    }

    pub fn element_ctx_get<T: DeserializeOwned>(&self, element_id: u16) -> Result<T> {
        self.get_value(&element_ctx_key(element_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (tempfile::TempDir, Nvs) {
        let dir = tempfile::tempdir().unwrap();
        let nvs = Nvs::init(dir.path().join("nvs"), TimerService::new()).unwrap();
        (dir, nvs)
    }

    #[tokio::test]
    async fn operations_require_an_open_store() {
        let (_dir, nvs) = fresh();
        assert!(matches!(nvs.set("k", b"v", false), Err(MeshxError::InvalidState(_))));
        assert!(matches!(nvs.get("k"), Err(MeshxError::InvalidState(_))));
        assert!(matches!(nvs.commit(), Err(MeshxError::InvalidState(_))));
        assert!(matches!(nvs.close(), Err(MeshxError::InvalidState(_))));
    }

    #[tokio::test]
    async fn double_open_is_rejected() {
        let (_dir, nvs) = fresh();
        nvs.open(0x7908, 4, 0).unwrap();
        assert!(matches!(nvs.open(0x7908, 4, 0), Err(MeshxError::InvalidState(_))));
        nvs.close().unwrap();
    }

    #[tokio::test]
    async fn committed_value_survives_reopen() {
        let (_dir, nvs) = fresh();
        nvs.open(0x7908, 4, 0).unwrap();
        nvs.set("blob", &[1, 2, 3, 4], true).unwrap();
        nvs.commit().unwrap();
        nvs.close().unwrap();

        nvs.open(0x7908, 4, 0).unwrap();
        let mut buf = [0u8; 4];
        nvs.get_into("blob", &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        nvs.close().unwrap();
    }

    #[tokio::test]
    async fn product_change_wipes_namespace() {
        let (_dir, nvs) = fresh();
        nvs.open(0x7908, 4, 0).unwrap();
        nvs.set("keep", b"x", false).unwrap();
        nvs.commit().unwrap();
        nvs.close().unwrap();

        nvs.open(0x7908, 5, 0).unwrap();
        assert!(matches!(nvs.get("keep"), Err(MeshxError::NotFound(_))));
        assert_eq!(nvs.get_value::<u16>(KEY_PID).unwrap(), 5);
        assert_eq!(nvs.get_value::<u16>(KEY_CID).unwrap(), 0x7908);
        nvs.close().unwrap();
    }

    #[tokio::test]
    async fn size_mismatch_and_missing_keys() {
        let (_dir, nvs) = fresh();
        nvs.open(1, 1, 0).unwrap();
        nvs.set("short", &[9, 9], false).unwrap();
        let mut buf = [0u8; 3];
        assert!(matches!(
            nvs.get_into("short", &mut buf),
            Err(MeshxError::SizeMismatch { stored: 2, buffer: 3 })
        ));
        assert!(matches!(nvs.remove("absent"), Err(MeshxError::NotFound(_))));
        assert!(matches!(
            nvs.set("a_key_that_is_too_long", b"", false),
            Err(MeshxError::InvalidArg(_))
        ));
        nvs.close().unwrap();
    }

    #[test]
    fn element_keys_are_zero_padded_hex() {
        assert_eq!(element_ctx_key(0x2a), "MESHX_EL_002a");
        assert!(element_ctx_key(0xffff).len() <= KEY_MAX_LEN);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stability_commit_runs_off_the_runtime_thread() {
        let (_dir, nvs) = fresh();
        nvs.open(0x7908, 0x0004, 20).unwrap();
        let runtime_thread = std::thread::current().id();
        nvs.set("k", &[1], true).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let threads = nvs.inner.commit_threads.lock().unwrap().clone();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|t| *t != runtime_thread));

        nvs.commit().unwrap();
        let threads = nvs.inner.commit_threads.lock().unwrap();
        assert_eq!(threads.last(), Some(&runtime_thread));
        drop(threads);
        nvs.close().unwrap();
    }
}
