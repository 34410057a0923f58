//! The dynamically-typed tree used for both task inputs and task
//! outputs.
//!
//! Grounded on SPEC_FULL.md §9's design note: model the input/output
//! tree as a tagged variant rather than reaching for a generic
//! container type, and dispatch on the tag wherever the fingerprint
//! engine or the scheduler needs to walk it. This mirrors
//! `lazypp/task.py`'s `_call_func_on_specific_class`, which performs
//! exactly this kind of tag-dispatch traversal over a plain Python
//! dict/list tree.

use std::{collections::BTreeMap, sync::Arc};

use color_eyre::{Result, eyre::bail};
use serde_json::json;

use crate::{artifact::Artifact, error::TaskGraphError, handle::TaskHandle};

/// A node in a task's input or output tree.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A file or directory artifact.
    Artifact(Artifact),
    /// A dependency task's entire (eventually resolved) output.
    Task(Arc<dyn TaskHandle>),
    /// A single field of a dependency task's output, accessed before
    /// that task has run — the deferred-output handle.
    Field(Arc<dyn TaskHandle>, String),
    /// A reusable artifact handle (only meaningful inside an input
    /// tree; never appears in a resolved output).
    Reusable(Arc<crate::reusable::ReusableArtifact>),
    Map(BTreeMap<String, Value>),
    Seq(Vec<Value>),
}

impl Value {
    pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::Map(entries.into_iter().collect())
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&Artifact> {
        match self {
            Value::Artifact(a) => Some(a),
            _ => None,
        }
    }

    /// Whether this value is a valid *root* for a task input or
    /// output: a string-keyed map. Nested values may be any variant.
    pub fn validate_root_is_map(&self, what: &str) -> Result<()> {
        if matches!(self, Value::Map(_)) {
            Ok(())
        } else {
            bail!(TaskGraphError::InvalidInput(format!(
                "{what} must be a map, got {self:?}"
            )))
        }
    }

    /// Visit every [`Artifact`] reachable in this tree, depth-first,
    /// erroring if a dependency-task or reusable-artifact node is
    /// encountered — those must already have been resolved away by
    /// the time an output is archived.
    pub fn for_each_artifact_mut(
        &mut self,
        f: &mut impl FnMut(&mut Artifact) -> Result<()>,
    ) -> Result<()> {
        match self {
            Value::Artifact(a) => f(a),
            Value::Map(m) => {
                for v in m.values_mut() {
                    v.for_each_artifact_mut(f)?;
                }
                Ok(())
            }
            Value::Seq(s) => {
                for v in s.iter_mut() {
                    v.for_each_artifact_mut(f)?;
                }
                Ok(())
            }
            Value::Task(_) | Value::Field(_, _) | Value::Reusable(_) => {
                bail!(TaskGraphError::InvalidOutput(
                    "output contains an unresolved task or reusable-artifact reference"
                        .to_string()
                ))
            }
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {
                Ok(())
            }
        }
    }

    /// Convert a fully resolved value (no `Task`/`Field`/`Reusable`
    /// nodes remain) into the JSON form persisted in `output.pkl` /
    /// `input.json`. Artifacts are encoded as a small tagged object
    /// pointing at their current (by this point, archived) source
    /// path.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Str(s) => json!(s),
            Value::Artifact(a) => json!({
                "__artifact__": true,
                "kind": a.kind(),
                "dest": a.dest().to_string_lossy(),
                "source": a.source().to_string_lossy(),
            }),
            Value::Map(m) => {
                let mut out = serde_json::Map::new();
                for (k, v) in m {
                    out.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(out)
            }
            Value::Seq(s) => {
                serde_json::Value::Array(s.iter().map(Value::to_json).collect::<Result<_>>()?)
            }
            Value::Task(_) | Value::Field(_, _) | Value::Reusable(_) => {
                bail!(TaskGraphError::InvalidOutput(
                    "cannot serialize an unresolved task or reusable-artifact reference"
                        .to_string()
                ))
            }
        })
    }

    /// Inverse of [`Value::to_json`].
    pub fn from_json(json: &serde_json::Value) -> Result<Value> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Object(obj) if obj.get("__artifact__").is_some() => {
                let kind = obj
                    .get("kind")
                    .ok_or_else(|| color_eyre::eyre::eyre!("artifact record missing kind"))?;
                let kind: crate::artifact::ArtifactKind = serde_json::from_value(kind.clone())?;
                let dest = obj
                    .get("dest")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| color_eyre::eyre::eyre!("artifact record missing dest"))?;
                let source = obj
                    .get("source")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| color_eyre::eyre::eyre!("artifact record missing source"))?;
                // Rehydrated artifacts default to copy-on-stage: the
                // source points directly at a shared cache blob, and
                // copying out of it (rather than hard-linking) keeps a
                // task body's in-place edits from corrupting a blob
                // other cache entries still reference.
                let artifact = match kind {
                    crate::artifact::ArtifactKind::File => Artifact::file(source, dest, true)?,
                    crate::artifact::ArtifactKind::Directory => {
                        Artifact::directory(source, dest, true)?
                    }
                };
                Value::Artifact(artifact)
            }
            serde_json::Value::Object(obj) => Value::Map(
                obj.iter()
                    .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                    .collect::<Result<_>>()?,
            ),
            serde_json::Value::Array(arr) => {
                Value::Seq(arr.iter().map(Value::from_json).collect::<Result<_>>()?)
            }
        })
    }
}
