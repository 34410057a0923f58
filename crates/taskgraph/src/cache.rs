//! The on-disk, content-addressed cache store.
//!
//! Grounded on `cache/local/mod.rs`'s `LocalBackend` (open/store/load
//! shape) and on `cache/local/cas.rs`'s atomic-rename commit pattern;
//! the flat `<fingerprint>_<name>/` layout (rather than `cas.rs`'s
//! two-level hex sharding) follows `lazypp/task.py`'s `_cache_output`,
//! since the fingerprint is already a pre-hashed, evenly distributed
//! key and this cache has no CAS-style dedup-by-content requirement
//! at the entry level (only artifacts inside an entry are
//! content-addressed, in their own per-key slot).

use std::path::{Path, PathBuf};

use color_eyre::eyre::Context;
use futures::future::BoxFuture;
use tracing::{debug, instrument, trace};

use crate::{error::{self, TaskGraphError}, fingerprint::Fingerprint, fs, value::Value};

/// Recursively archive every artifact in `value` into `slot_dir`,
/// rewriting each artifact's source path in place. A dedicated
/// recursive async function rather than [`Value::for_each_artifact_mut`]
/// (which takes a synchronous visitor) because archiving is itself
/// async.
fn archive_artifacts<'a>(
    value: &'a mut Value,
    work_dir: &'a Path,
    slot_dir: &'a Path,
) -> BoxFuture<'a, error::Result<()>> {
    Box::pin(async move {
        match value {
            Value::Artifact(artifact) => {
                artifact
                    .archive_into(work_dir, slot_dir)
                    .await
                    .map_err(TaskGraphError::Other)?;
                Ok(())
            }
            Value::Map(map) => {
                for v in map.values_mut() {
                    archive_artifacts(v, work_dir, slot_dir).await?;
                }
                Ok(())
            }
            Value::Seq(items) => {
                for v in items.iter_mut() {
                    archive_artifacts(v, work_dir, slot_dir).await?;
                }
                Ok(())
            }
            Value::Task(_) | Value::Field(_, _) | Value::Reusable(_) => {
                Err(TaskGraphError::InvalidOutput(
                    "output contains an unresolved task or reusable-artifact reference"
                        .to_string(),
                ))
            }
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {
                Ok(())
            }
        }
    })
}

/// A fingerprint-keyed, content-addressed on-disk cache.
#[derive(Clone, Debug)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<fingerprint>_<name>/`.
    pub fn entry_dir(&self, fingerprint: &Fingerprint, name: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}", fingerprint.to_hex(), sanitize(name)))
    }

    pub fn stdout_log_path(&self, fingerprint: &Fingerprint, name: &str) -> PathBuf {
        self.entry_dir(fingerprint, name).join("stdout.log")
    }

    pub fn stderr_log_path(&self, fingerprint: &Fingerprint, name: &str) -> PathBuf {
        self.entry_dir(fingerprint, name).join("stderr.log")
    }

    /// Whether a committed entry exists for `fingerprint`. The
    /// commit marker is `output.pkl`'s presence, matching
    /// `_cache_output`'s "pickle the output dict last" ordering.
    #[instrument(skip(self))]
    pub async fn lookup(&self, fingerprint: &Fingerprint, name: &str) -> bool {
        fs::exists(&self.entry_dir(fingerprint, name).join("output.pkl")).await
    }

    /// Load a committed output. Errors with
    /// [`TaskGraphError::CacheNotFound`] if no entry exists —
    /// internal callers should `lookup` first to treat absence as a
    /// plain cache miss rather than an error.
    #[instrument(skip(self))]
    pub async fn load(&self, fingerprint: &Fingerprint, name: &str) -> error::Result<Value> {
        let path = self.entry_dir(fingerprint, name).join("output.pkl");
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskGraphError::CacheNotFound(fingerprint.to_hex()));
            }
            Err(err) => {
                return Err(TaskGraphError::Other(
                    color_eyre::eyre::Report::from(err).wrap_err("read output.pkl"),
                ));
            }
        };
        let json: serde_json::Value = serde_json::from_slice(&bytes)
            .context("deserialize output.pkl")
            .map_err(TaskGraphError::Other)?;
        let value = Value::from_json(&json).map_err(TaskGraphError::Other)?;
        trace!(%fingerprint, "loaded cache entry");
        Ok(value)
    }

    /// Commit `output` for `fingerprint`: archive every artifact
    /// reachable under each top-level output key into that key's
    /// slot directory, write `input.json`, then write `output.pkl`
    /// last so its presence remains the atomic commit marker.
    #[instrument(skip(self, output))]
    pub async fn store(
        &self,
        fingerprint: &Fingerprint,
        name: &str,
        output: &mut Value,
        work_dir: &Path,
        input_debug: &serde_json::Value,
    ) -> error::Result<()> {
        let entry_dir = self.entry_dir(fingerprint, name);
        // The task runtime writes stdout.log/stderr.log into this
        // directory while the body is still running, ahead of this
        // call. Hold their bytes in memory across the wipe-and-recreate
        // below so a captured stream doesn't vanish under its own entry.
        let stdout_log = tokio::fs::read(self.stdout_log_path(fingerprint, name)).await.ok();
        let stderr_log = tokio::fs::read(self.stderr_log_path(fingerprint, name)).await.ok();
        if fs::exists(&entry_dir).await {
            fs::remove_dir_all(&entry_dir)
                .await
                .map_err(TaskGraphError::Other)?;
        }
        fs::create_dir_all(&entry_dir)
            .await
            .map_err(TaskGraphError::Other)?;
        if let Some(bytes) = stdout_log {
            fs::write_bytes(&self.stdout_log_path(fingerprint, name), &bytes)
                .await
                .map_err(TaskGraphError::Other)?;
        }
        if let Some(bytes) = stderr_log {
            fs::write_bytes(&self.stderr_log_path(fingerprint, name), &bytes)
                .await
                .map_err(TaskGraphError::Other)?;
        }

        let Value::Map(keys) = output else {
            return Err(TaskGraphError::InvalidOutput(
                "output must be a map".to_string(),
            ));
        };
        for (key, value) in keys.iter_mut() {
            let slot_dir = entry_dir.join(key);
            fs::create_dir_all(&slot_dir)
                .await
                .map_err(TaskGraphError::Other)?;
            archive_artifacts(value, work_dir, &slot_dir).await?;
            let key_json = value.to_json().map_err(TaskGraphError::Other)?;
            let data = serde_json::to_vec_pretty(&key_json)
                .context("serialize output slot")
                .map_err(TaskGraphError::Other)?;
            fs::write_bytes(&slot_dir.join("data"), &data)
                .await
                .map_err(TaskGraphError::Other)?;
        }

        let input_json = serde_json::to_vec_pretty(input_debug)
            .context("serialize input.json")
            .map_err(TaskGraphError::Other)?;
        fs::write_bytes(&entry_dir.join("input.json"), &input_json)
            .await
            .map_err(TaskGraphError::Other)?;

        let output_json = output.to_json().map_err(TaskGraphError::Other)?;
        let output_bytes = serde_json::to_vec_pretty(&output_json)
            .context("serialize output.pkl")
            .map_err(TaskGraphError::Other)?;
        fs::write_bytes(&entry_dir.join("output.pkl"), &output_bytes)
            .await
            .map_err(TaskGraphError::Other)?;

        debug!(%fingerprint, "stored cache entry");
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
