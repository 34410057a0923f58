//! Dependency resolution: walk a task's input, run every distinct
//! embedded dependency task concurrently, and rebuild a fully
//! resolved copy of the input.
//!
//! Grounded on SPEC_FULL.md §4.5's two-phase design note (collect the
//! distinct dependency handles, launch them concurrently, then
//! reconstruct) and on `handle::identity`'s pointer-identity dedup,
//! which is what keeps a diamond-shaped dependency graph from being
//! invoked more than once per task instance.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use color_eyre::eyre::eyre;

use crate::{
    error::{self, TaskGraphError},
    handle::{self, TaskHandle},
    value::Value,
};

/// Resolve every `Task`/`Field` node reachable in `value`, returning a
/// value tree with no deferred nodes remaining.
///
/// Collects the distinct task handles reachable from `value` (deduped
/// by the identity of the underlying `Arc` allocation), invokes them
/// all concurrently, then rebuilds `value` with every deferred node
/// substituted by its resolved output. Substituting into a freshly
/// built copy rather than mutating `value` in place sidesteps the
/// interior-mutability hazards of concurrently traversed shared
/// subgraphs; externally this is indistinguishable from the node
/// "rewriting itself" once resolved.
pub async fn resolve(value: &Value) -> error::Result<Value> {
    let mut handles = Vec::new();
    collect_handles(value, &mut handles);

    let outputs = futures::future::join_all(
        handles
            .iter()
            .map(|handle| async move { (handle::identity(handle), handle.invoke().await) }),
    )
    .await;

    let mut resolved: HashMap<usize, Value> = HashMap::with_capacity(outputs.len());
    for (id, output) in outputs {
        resolved.insert(id, output?);
    }

    substitute(value, &resolved)
}

fn collect_handles(value: &Value, out: &mut Vec<Arc<dyn TaskHandle>>) {
    match value {
        Value::Task(handle) | Value::Field(handle, _) => {
            let id = handle::identity(handle);
            if !out.iter().any(|existing| handle::identity(existing) == id) {
                out.push(Arc::clone(handle));
            }
        }
        Value::Map(map) => {
            for v in map.values() {
                collect_handles(v, out);
            }
        }
        Value::Seq(items) => {
            for v in items {
                collect_handles(v, out);
            }
        }
        _ => {}
    }
}

fn substitute(value: &Value, resolved: &HashMap<usize, Value>) -> error::Result<Value> {
    match value {
        Value::Task(handle) => resolved
            .get(&handle::identity(handle))
            .cloned()
            .ok_or_else(|| TaskGraphError::Other(eyre!("unresolved dependency task handle"))),
        Value::Field(handle, key) => {
            let output = resolved
                .get(&handle::identity(handle))
                .ok_or_else(|| TaskGraphError::Other(eyre!("unresolved dependency task handle")))?;
            output.get(key).cloned().ok_or_else(|| {
                TaskGraphError::InvalidOutput(format!("no such output field: {key}"))
            })
        }
        Value::Map(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, resolved)?);
            }
            Ok(Value::Map(out))
        }
        Value::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for v in items {
                out.push(substitute(v, resolved)?);
            }
            Ok(Value::Seq(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Fixed(Value);

    impl TaskHandle for Fixed {
        fn fingerprint(&self) -> BoxFuture<'_, error::Result<crate::fingerprint::Fingerprint>> {
            unimplemented!("not exercised by these tests")
        }

        fn invoke(&self) -> BoxFuture<'_, error::Result<Value>> {
            Box::pin(async move { Ok(self.0.clone()) })
        }

        fn display_name(&self) -> &str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn resolves_task_and_field_nodes() {
        let upstream: Arc<dyn TaskHandle> = Arc::new(Fixed(Value::map([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ])));

        let input = Value::map([
            ("whole".to_string(), Value::Task(Arc::clone(&upstream))),
            ("field".to_string(), Value::Field(Arc::clone(&upstream), "b".to_string())),
        ]);

        let resolved = resolve(&input).await.unwrap();
        assert_eq!(resolved.get("whole").unwrap().get("a").unwrap().as_int(), Some(1));
        assert_eq!(resolved.get("field").unwrap().as_int(), Some(2));
    }

    #[tokio::test]
    async fn shared_dependency_invoked_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Debug)]
        struct Counting(Arc<AtomicUsize>);
        impl TaskHandle for Counting {
            fn fingerprint(&self) -> BoxFuture<'_, error::Result<crate::fingerprint::Fingerprint>> {
                unimplemented!("not exercised by this test")
            }
            fn invoke(&self) -> BoxFuture<'_, error::Result<Value>> {
                Box::pin(async move {
                    self.0.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::map([("n".to_string(), Value::Int(1))]))
                })
            }
            fn display_name(&self) -> &str {
                "counting"
            }
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let shared: Arc<dyn TaskHandle> = Arc::new(Counting(Arc::clone(&counter)));
        let input = Value::Seq(vec![
            Value::Task(Arc::clone(&shared)),
            Value::Task(Arc::clone(&shared)),
        ]);
        resolve(&input).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
