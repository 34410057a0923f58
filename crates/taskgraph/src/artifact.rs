//! File and directory artifacts: values that refer to something on
//! disk rather than living entirely in memory.
//!
//! Grounded on `cache/local/cas.rs`'s blake3-streamed content hashing
//! and atomic-rename commit pattern, and on `fs.rs`'s `hash_file`; the
//! escape check is new, grounded on the Python source's
//! `_is_outside_base` (see [`crate::path::is_outside_base`]).

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::{digest::Digest128, error::TaskGraphError, fs, path::RelPath};

/// The kind of artifact, carried alongside the archived record so it
/// can be rehydrated without re-probing the filesystem.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ArtifactKind {
    File,
    Directory,
}

/// A value referring to a file or directory, somewhere between "not
/// yet materialized" (fresh from a task body, living in a work
/// directory) and "archived" (living in the cache, source path
/// rewritten to point at the cached blob).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    kind: ArtifactKind,
    /// Where the artifact currently lives. Absolute once staged or
    /// archived; may be a path a task body just wrote to.
    source: PathBuf,
    /// Where the artifact should land, relative to whatever base it's
    /// staged into. Validated not to escape that base at construction
    /// time.
    dest: PathBuf,
    /// Whether staging this artifact into a work directory should
    /// copy it (`true`) or hard-link it (`false`).
    copy: bool,
}

impl Artifact {
    /// Construct a file artifact.
    ///
    /// `dest` defaults to `source`'s own relative form when not
    /// given explicitly by the caller; in this crate callers always
    /// supply an explicit destination, since inputs/outputs only ever
    /// reach this type after a destination has been decided.
    pub fn file(source: impl Into<PathBuf>, dest: impl Into<PathBuf>, copy: bool) -> Result<Self> {
        Self::new(ArtifactKind::File, source, dest, copy)
    }

    /// Construct a directory artifact.
    pub fn directory(
        source: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        copy: bool,
    ) -> Result<Self> {
        Self::new(ArtifactKind::Directory, source, dest, copy)
    }

    fn new(kind: ArtifactKind, source: impl Into<PathBuf>, dest: impl Into<PathBuf>, copy: bool) -> Result<Self> {
        let dest = dest.into();
        let rel = RelPath::new(dest.clone()).context("artifact destination must be relative")?;
        if rel.escapes_base() {
            bail!(TaskGraphError::ArtifactEscape(dest.display().to_string()));
        }
        Ok(Self {
            kind,
            source: source.into(),
            dest,
            copy,
        })
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Content hash: a streaming blake3 digest of file bytes (file
    /// artifacts) or of every regular file's bytes visited in
    /// deterministic, sorted-relative-path order (directory
    /// artifacts). Stat metadata (mode bits, symlink-ness) is not
    /// part of the hash — see the Open Question resolution in
    /// DESIGN.md.
    #[instrument]
    pub async fn content_hash(&self) -> Result<Digest128> {
        let hash = match self.kind {
            ArtifactKind::File => fs::hash_file(&self.source).await?,
            ArtifactKind::Directory => fs::hash_dir(&self.source).await?,
        };
        Ok(Digest128::from_blake3(hash))
    }

    /// Stage this artifact into `work_dir`, at `work_dir/self.dest`,
    /// copying or hard-linking according to the artifact's copy flag.
    /// Artifacts constructed with `copy = false` are assumed to
    /// already be reachable via a link and are left alone.
    #[instrument]
    pub async fn stage_into(&self, work_dir: &Path) -> Result<()> {
        if !self.copy {
            return Ok(());
        }
        let dst = work_dir.join(&self.dest);
        match self.kind {
            ArtifactKind::File => {
                fs::copy_file(&self.source, &dst).await?;
            }
            ArtifactKind::Directory => {
                fs::copy_dir(&self.source, &dst).await?;
            }
        }
        trace!(source = ?self.source, dest = ?dst, "staged artifact");
        Ok(())
    }

    /// Archive the materialized artifact at `work_dir/self.dest` into
    /// `slot_dir/<content_hash>`, then rewrite `source` to point at
    /// the archived blob. Returns the content hash, which the caller
    /// uses to build the cache entry's `input.json`/`output.pkl`
    /// record.
    #[instrument]
    pub async fn archive_into(&mut self, work_dir: &Path, slot_dir: &Path) -> Result<Digest128> {
        let produced = work_dir.join(&self.dest);
        let hash = match self.kind {
            ArtifactKind::File => Digest128::from_blake3(fs::hash_file(&produced).await?),
            ArtifactKind::Directory => Digest128::from_blake3(fs::hash_dir(&produced).await?),
        };
        let archived = slot_dir.join(hash.to_hex());

        if !fs::exists(&archived).await {
            // Stage via a unique temp path, then atomically rename
            // into place, so a half-written archive is never visible
            // under its final name.
            let tmp = slot_dir.join(format!(".tmp.{}", Uuid::new_v4()));
            match self.kind {
                ArtifactKind::File => {
                    fs::copy_file(&produced, &tmp).await?;
                }
                ArtifactKind::Directory => {
                    fs::copy_dir(&produced, &tmp).await?;
                }
            }
            fs::rename(&tmp, &archived).await?;
        }

        self.source = archived;
        trace!(hash = %hash, "archived artifact");
        Ok(hash)
    }

    /// Materialize this artifact at an arbitrary destination path,
    /// failing with [`TaskGraphError::AlreadyExists`] unless
    /// `overwrite` is set.
    #[instrument]
    pub async fn copy(&self, dest: &Path, overwrite: bool) -> Result<()> {
        if fs::exists(dest).await {
            if !overwrite {
                bail!(TaskGraphError::AlreadyExists(dest.display().to_string()));
            }
            if self.kind == ArtifactKind::Directory {
                fs::remove_dir_all(dest).await?;
            } else {
                fs::remove_file(dest).await?;
            }
        }
        match self.kind {
            ArtifactKind::File => {
                fs::copy_file(&self.source, dest).await?;
            }
            ArtifactKind::Directory => {
                fs::copy_dir(&self.source, dest).await?;
            }
        }
        Ok(())
    }
}
