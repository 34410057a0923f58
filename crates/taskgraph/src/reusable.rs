//! Reusable artifacts: cross-process, id-keyed, first-writer-wins
//! file production.
//!
//! The lock typestate is adapted directly from `fs.rs`'s
//! `LockFile<State>`; the fast-path/slow-path/mutable protocol is
//! grounded on `lazypp/reusable_file_objects.py`'s
//! `ReusableFile.__enter__`/`__exit__`, and the "release deletes the
//! lock file" behavior is confirmed by `lazypp/file_lock.py`'s
//! `FileLock.release`.

use std::{
    future::Future,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{Result, eyre::Context};
use fslock::LockFile as FsLockFile;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace};

use crate::{
    digest::Digest128,
    error::{self, TaskGraphError},
    fingerprint::Fingerprint,
    fs,
    handle::TaskHandle,
};

/// Marker: the lock file handle has not been locked.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Unlocked;

/// Marker: the lock file handle currently holds the advisory lock.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Locked;

/// A shared advisory lock file, typestate-guarded so a handle cannot
/// be double-locked or double-unlocked (both of which panic in
/// `fslock`).
#[derive(Clone, Debug)]
struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    inner: Arc<Mutex<FsLockFile>>,
}

impl LockFile<Unlocked> {
    async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let (file, path) = spawn_blocking(move || {
            FsLockFile::open(&path).map(|file| (file, path))
        })
        .await
        .context("join task")?
        .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            self.inner.blocking_lock().lock().context("lock file")?;
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
    }
}

impl LockFile<Locked> {
    async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || {
            self.inner.blocking_lock().unlock().context("unlock file")?;
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
    }
}

/// An intermediate whose production is expensive but whose identity
/// is stable across many downstream tasks. See SPEC_FULL.md §4.6.
#[derive(Debug)]
pub struct ReusableArtifact {
    id: String,
    cache_root: PathBuf,
    fingerprint: Fingerprint,
    copy: bool,
    mutable: bool,
}

impl ReusableArtifact {
    /// `fingerprint = H(id ∥ concat(dependent fingerprints))`. The
    /// dependent list lets several reusable artifacts share an `id`
    /// while remaining distinct when their producing tasks' inputs
    /// differ.
    #[instrument(skip(dependents))]
    pub async fn new(
        id: impl Into<String>,
        cache_root: impl Into<PathBuf>,
        dependents: &[Arc<dyn TaskHandle>],
        copy: bool,
        mutable: bool,
    ) -> error::Result<Self> {
        let id = id.into();
        let mut hasher = blake3::Hasher::new();
        hasher.update(id.as_bytes());
        for dep in dependents {
            let fp = dep.fingerprint().await?;
            hasher.update(fp.0.as_bytes());
        }
        let fingerprint = Fingerprint(Digest128::from_blake3(hasher.finalize()));
        Ok(Self {
            id,
            cache_root: cache_root.into(),
            fingerprint,
            copy,
            mutable,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    fn committed_path(&self) -> PathBuf {
        self.cache_root.join("reusable").join(self.fingerprint.to_hex())
    }

    fn lock_path(&self) -> PathBuf {
        self.cache_root
            .join("reusable")
            .join(format!("{}.lock", self.fingerprint.to_hex()))
    }

    /// Enter the scoped block: `body` receives a local path to work
    /// with and its result is returned. On exit, a freshly produced
    /// artifact (or, when `mutable`, any re-entry) is copied back into
    /// the shared cache.
    ///
    /// This closure-taking shape is the Rust stand-in for the
    /// original's `with ReusableFile(...) as path:` block — Rust has
    /// no context-manager syntax, and relying on `Drop` here would
    /// require async cleanup `Drop` can't do.
    #[instrument(skip(body))]
    pub async fn with<F, Fut, T>(&self, work_dir: &Path, body: F) -> error::Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = error::Result<T>>,
    {
        fs::create_dir_all(work_dir).await?;
        let local = work_dir.join(format!("reusable-{}", self.fingerprint.to_hex()));
        let committed = self.committed_path();

        if fs::exists(&committed).await {
            trace!(fingerprint = %self.fingerprint, "reusable artifact fast path");
            self.materialize_local(&committed, &local).await?;
            let result = body(local.clone()).await?;
            if self.mutable {
                fs::copy_file(&local, &committed).await?;
            }
            return Ok(result);
        }

        fs::create_dir_all(
            committed
                .parent()
                .expect("committed path always has a parent"),
        )
        .await?;
        let lock = LockFile::open(self.lock_path()).await?;
        let lock = lock.lock().await?;

        if fs::exists(&committed).await {
            // Another producer raced us while we were acquiring the lock.
            trace!(fingerprint = %self.fingerprint, "reusable artifact produced while waiting for lock");
            lock.unlock().await?;
            self.materialize_local(&committed, &local).await?;
            let result = body(local.clone()).await?;
            if self.mutable {
                fs::copy_file(&local, &committed).await?;
            }
            return Ok(result);
        }

        trace!(fingerprint = %self.fingerprint, "reusable artifact slow path: producing");
        let result = body(local.clone()).await?;
        fs::copy_file(&local, &committed)
            .await
            .context("commit produced reusable artifact")?;
        lock.unlock().await?;
        fs::remove_file(&self.lock_path())
            .await
            .context("remove lock file")?;
        Ok(result)
    }

    async fn materialize_local(&self, committed: &Path, local: &Path) -> error::Result<()> {
        if self.copy {
            fs::copy_file(committed, local).await?;
        } else {
            fs::hard_link(committed, local).await?;
        }
        Ok(())
    }
}
