//! Typed filesystem paths.
//!
//! We keep only the distinction the rest of the crate actually leans
//! on: absolute paths (where things live on disk) versus relative
//! paths (where an artifact wants to land inside a work directory, and
//! therefore the thing the escape-check below has to validate).

use std::path::{Component, Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{bail, eyre},
};
use derive_more::Display;

/// An absolute path on the local filesystem.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display("{}", path.display())]
pub struct AbsPath {
    path: PathBuf,
}

impl AbsPath {
    /// Wrap `path`, requiring it to already be absolute.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            bail!("path is not absolute: {path:?}");
        }
        Ok(Self { path })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, rel: &RelPath) -> AbsPath {
        AbsPath {
            path: self.path.join(&rel.path),
        }
    }

    pub fn join_str(&self, part: impl AsRef<Path>) -> AbsPath {
        AbsPath {
            path: self.path.join(part),
        }
    }

    pub fn parent(&self) -> Option<AbsPath> {
        self.path.parent().map(|p| AbsPath {
            path: p.to_path_buf(),
        })
    }
}

impl From<AbsPath> for PathBuf {
    fn from(value: AbsPath) -> Self {
        value.path
    }
}

/// A relative path, destined to land somewhere under a work directory.
///
/// Construction normalizes nothing — the point of `escapes_base` is to
/// detect, rather than silently fix up, a destination that would
/// resolve outside its intended root.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display("{}", path.display())]
pub struct RelPath {
    path: PathBuf,
}

impl RelPath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_absolute() {
            bail!("expected a relative path, got: {path:?}");
        }
        Ok(Self { path })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Cumulative-depth escape check: `.` contributes 0, `..`
    /// contributes -1, anything else contributes +1. If the running
    /// depth ever goes negative, the path has walked above its base.
    pub fn escapes_base(&self) -> bool {
        is_outside_base(&self.path)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|s| s.to_str())
    }
}

/// Standalone form of the escape check, usable on any [`Path`] without
/// first constructing a [`RelPath`] (e.g. while validating components
/// one at a time).
pub fn is_outside_base(path: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::CurDir => {}
            Component::Normal(_) => depth += 1,
            // Absolute-path components have no business appearing in
            // something that's supposed to be relative; treat them as
            // an immediate escape rather than panicking.
            Component::RootDir | Component::Prefix(_) => return true,
        }
        if depth < 0 {
            return true;
        }
    }
    false
}

/// Compute `path` relative to `base`, failing if `path` is not nested
/// under `base`.
pub fn relative_to(path: &Path, base: &Path) -> Result<RelPath> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| eyre!("{path:?} is not nested under {base:?}"))?;
    RelPath::new(rel.to_path_buf())
}
