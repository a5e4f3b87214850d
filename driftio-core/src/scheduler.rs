//! Child-task bookkeeping for the sync pumps.
//!
//! Each phase owns a [`ChildSet`] of entry workers: spawn, harvest finished
//! children without blocking, block for one child when the spawn window is
//! full, and drain everything at a phase boundary.

use crate::{DriftError, Result};
use std::future::Future;
use tokio::task::JoinSet;

#[derive(Default)]
pub struct ChildSet {
    tasks: JoinSet<Result<()>>,
}

impl ChildSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    /// Block until one child completes. `None` when there are no children.
    pub async fn wait_for_child(&mut self) -> Option<Result<()>> {
        self.tasks.join_next().await.map(flatten_join)
    }

    /// Harvest every already-finished child without blocking, appending
    /// failures to `errors`. Returns whether children are still running.
    pub fn try_collect(&mut self, errors: &mut Vec<DriftError>) -> bool {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(error) = flatten_join(result) {
                errors.push(error);
            }
        }
        !self.tasks.is_empty()
    }

    /// Block until the in-flight count drops back to `window`, collecting
    /// failures along the way.
    pub async fn keep_within(&mut self, window: usize, errors: &mut Vec<DriftError>) {
        while self.tasks.len() > window {
            if let Some(Err(error)) = self.wait_for_child().await {
                errors.push(error);
            }
            self.try_collect(errors);
        }
    }

    /// Block until every child completes, returning all failures.
    pub async fn drain(&mut self) -> Vec<DriftError> {
        let mut errors = Vec::new();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(error) = flatten_join(result) {
                errors.push(error);
            }
        }
        errors
    }
}

fn flatten_join(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(join_error) => Err(DriftError::Internal(format!(
            "sync worker panicked: {}",
            join_error
        ))),
    }
}
