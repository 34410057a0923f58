//! The type-erased seam between a concrete `Task<B>` and the rest of
//! the crate (the [`crate::value::Value`] tree, the scheduler).
//!
//! A task's concrete body type only matters to the code that
//! constructs it; everywhere else — nested inside another task's
//! input, inside the scheduler's dependency set — it is addressed
//! through this trait object.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{error::Result, fingerprint::Fingerprint, value::Value};

/// Operations the scheduler and fingerprint engine need from any task,
/// regardless of its body type.
pub trait TaskHandle: Send + Sync + std::fmt::Debug {
    /// This task's fingerprint, computed (once) from its body digest
    /// and canonicalized input.
    fn fingerprint(&self) -> BoxFuture<'_, Result<Fingerprint>>;

    /// Run this task to completion (or return its already-memoized
    /// output), returning its output value.
    fn invoke(&self) -> BoxFuture<'_, Result<Value>>;

    /// The name used in cache directory suffixes and logs.
    fn display_name(&self) -> &str;
}

/// The identity of the allocation backing `handle`, used by the
/// scheduler's visited-set traversal to collapse multiple references
/// to the same task instance.
pub fn identity(handle: &Arc<dyn TaskHandle>) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}
