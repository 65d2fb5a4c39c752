//! Scoped resource stack.
//!
//! Each acquired resource pushes an async release callback. `close` runs the
//! callbacks in reverse acquisition order, so a session is always released
//! before the transport it runs on.

use crate::transport::BoxFuture;
use std::future::Future;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// An ordered set of acquired resources with a single teardown.
#[derive(Default)]
pub struct ResourceStack {
    entries: Vec<(&'static str, Release)>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the release of a resource that has just been acquired.
    pub fn push<F, Fut>(&mut self, label: &'static str, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("Acquired {label}");
        self.entries
            .push((label, Box::new(move || Box::pin(release()) as BoxFuture<'static, ()>)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels of the held resources, oldest first.
    pub fn labels(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(label, _)| *label).collect()
    }

    /// Release every resource, newest first.
    pub async fn close(mut self) {
        while let Some((label, release)) = self.entries.pop() {
            tracing::debug!("Releasing {label}");
            release().await;
        }
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            tracing::warn!(
                "Resource stack dropped with {} unreleased resources: {:?}",
                self.entries.len(),
                self.labels()
            );
        }
    }
}

impl std::fmt::Debug for ResourceStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStack")
            .field("entries", &self.labels())
            .finish()
    }
}
