//! Filesystem operations tailored to the task graph.
//!
//! Inside this module we refer to `tokio::fs` rather than `std::fs`
//! wherever an async equivalent exists, and reserve blocking calls
//! (`spawn_blocking`) for APIs tokio doesn't wrap — content hashing and
//! advisory locking, primarily.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tap::TapFallible;
use tokio::io::AsyncReadExt;
use tracing::{instrument, trace};
use walkdir::WalkDir;

/// Create the directory and all of its parents, if they don't exist.
#[instrument]
pub async fn create_dir_all(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Write `content` to `path`, creating its parent directory if needed.
#[instrument(skip(content))]
pub async fn write_bytes(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Copy the file from `src` to `dst`, creating `dst`'s parent
/// directory if needed. Returns the number of bytes copied.
#[instrument]
pub async fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("copy {src:?} to {dst:?}"))
        .tap_ok(|bytes| trace!(?src, ?dst, ?bytes, "copy file"))
}

/// Recursively copy every regular file under `src` into `dst`,
/// preserving relative paths. Returns the total number of files
/// copied.
#[instrument]
pub async fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    let entries = sorted_relative_files(src)?;
    let mut copied = 0u64;
    for rel in &entries {
        copy_file(&src.join(rel), &dst.join(rel)).await?;
        copied += 1;
    }
    Ok(copied)
}

/// Every regular file under `root`, as paths relative to `root`,
/// sorted lexicographically. This is the deterministic walk order the
/// fingerprint engine and directory content-hashing rely on.
#[instrument]
pub fn sorted_relative_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk directory {root:?}"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{:?} is not nested under {root:?}", entry.path()))?;
        out.push(rel.to_path_buf());
    }
    out.sort();
    Ok(out)
}

/// Remove a file. Succeeds if the file is already absent.
#[instrument]
pub async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove file: {path:?}")),
    }
    .tap_ok(|_| trace!(?path, "remove file"))
}

/// Remove a directory and all of its contents. Succeeds if it's
/// already absent.
#[instrument]
pub async fn remove_dir_all(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("remove directory: {path:?}")),
    }
}

/// Rename (move) `src` to `dst`, overwriting `dst` if present.
#[instrument]
pub async fn rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename"))
}

/// Create a hard link at `link` pointing at `original`, replacing any
/// existing file at `link`.
#[instrument]
pub async fn hard_link(original: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    if exists(link).await {
        remove_file(link).await.context("remove link destination")?;
    }
    tokio::fs::hard_link(original, link)
        .await
        .with_context(|| format!("hard link {original:?} -> {link:?}"))
}

/// Whether the path exists. Races are possible; callers that act on
/// the result should handle the file disappearing or appearing
/// between the check and the subsequent operation.
#[instrument]
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Whether the path is a directory.
#[instrument]
pub async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_dir())
}

/// Whether the path is a regular file.
#[instrument]
pub async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file())
}

/// Hash the contents of a single file, streaming in 64 KiB chunks.
#[instrument]
pub async fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open file: {path:?}"))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut bytes = 0usize;
    loop {
        let len = file.read(&mut buf).await.context("read chunk")?;
        if len == 0 {
            break;
        }
        hasher.update(&buf[..len]);
        bytes += len;
    }
    let hash = hasher.finalize();
    trace!(?path, %hash, bytes, "hash file");
    Ok(hash)
}

/// Hash every regular file under `root`, visited in deterministic
/// (sorted-by-relative-path) order, as a single streaming digest.
#[instrument]
pub async fn hash_dir(root: &Path) -> Result<blake3::Hash> {
    let files = sorted_relative_files(root)?;
    let mut hasher = blake3::Hasher::new();
    for rel in files {
        let path = root.join(&rel);
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open file: {path:?}"))?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let len = file.read(&mut buf).await.context("read chunk")?;
            if len == 0 {
                break;
            }
            hasher.update(&buf[..len]);
        }
    }
    let hash = hasher.finalize();
    trace!(?root, %hash, "hash directory");
    Ok(hash)
}
