//! Structured fan-out / fan-in
//!
//! Every task launched in a `TaskGroup` runs to completion; one failure never
//! cancels its siblings, so no node-level capture process is left orphaned.
//! `join` returns every outcome in launch order.

use futures::future::{join_all, BoxFuture};
use std::fmt;
use std::future::Future;

/// Concurrent tasks keyed by label
pub struct TaskGroup<'a, K, T, E> {
    tasks: Vec<(K, BoxFuture<'a, Result<T, E>>)>,
}

impl<'a, K, T, E> TaskGroup<'a, K, T, E> {
    #[must_use]
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Add a task; it starts when the group is joined
    pub fn spawn<F>(&mut self, label: K, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.tasks.push((label, Box::pin(task)));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drive all tasks concurrently and wait for every one of them
    pub async fn join(self) -> GroupOutcome<K, T, E> {
        let (labels, futures): (Vec<K>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = join_all(futures).await;
        GroupOutcome {
            results: labels.into_iter().zip(results).collect(),
        }
    }
}

impl<K, T, E> Default for TaskGroup<'_, K, T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated results of a joined group
#[derive(Debug)]
pub struct GroupOutcome<K, T, E> {
    results: Vec<(K, Result<T, E>)>,
}

impl<K, T, E> GroupOutcome<K, T, E> {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Failed tasks, in launch order
    pub fn failures(&self) -> impl Iterator<Item = (&K, &E)> {
        self.results
            .iter()
            .filter_map(|(k, r)| r.as_ref().err().map(|e| (k, e)))
    }

    /// Every outcome, in launch order
    #[must_use]
    pub fn into_results(self) -> Vec<(K, Result<T, E>)> {
        self.results
    }

    /// Successful values, or the first error in launch order
    pub fn into_result(self) -> Result<Vec<(K, T)>, E> {
        let mut out = Vec::with_capacity(self.results.len());
        for (k, r) in self.results {
            out.push((k, r?));
        }
        Ok(out)
    }
}

impl<K: fmt::Debug, T, E: fmt::Display> GroupOutcome<K, T, E> {
    /// Every failure rendered as `label: error`
    #[must_use]
    pub fn failure_summary(&self) -> Vec<String> {
        self.failures().map(|(k, e)| format!("{k:?}: {e}")).collect()
    }
}
