//! Live queries shared through the listener registry.

use std::sync::Arc;
use tracing::warn;

use super::{Document, QueryDescriptor, RemoteStore};
use crate::listener::{ListenerRegistry, Subscription};

/// Wraps [`RemoteStore::subscribe`] so that every caller watching the same
/// query shares one remote subscription.
pub struct LiveQueries<R: RemoteStore> {
  remote: Arc<R>,
  registry: ListenerRegistry<Vec<Document>>,
}

impl<R: RemoteStore> LiveQueries<R> {
  pub fn new(remote: Arc<R>, registry: ListenerRegistry<Vec<Document>>) -> Self {
    Self { remote, registry }
  }

  /// Registry key derived from the query itself.
  pub fn key_for(query: &QueryDescriptor) -> String {
    format!("live_{}", query.fingerprint())
  }

  /// Watch `query`, sharing the subscription with every other watcher of an equal query.
  pub fn watch<F>(&self, query: &QueryDescriptor, callback: F) -> Subscription
  where
    F: Fn(&Vec<Document>) + Send + Sync + 'static,
  {
    self.watch_keyed(&Self::key_for(query), query, callback)
  }

  /// Watch `query` under an explicit registry key.
  ///
  /// Errors on the remote subscription are logged; the subscription stays
  /// open and callers decide themselves whether to detach.
  pub fn watch_keyed<F>(&self, key: &str, query: &QueryDescriptor, callback: F) -> Subscription
  where
    F: Fn(&Vec<Document>) + Send + Sync + 'static,
  {
    let remote = Arc::clone(&self.remote);
    let query = query.clone();

    self.registry.attach(
      key,
      move |emitter| {
        let key = emitter.key().to_string();
        let description = query.description();
        remote.subscribe(
          query,
          Box::new(move |documents| {
            emitter.emit(&documents);
          }),
          Box::new(move |e| {
            warn!(key = %key, query = %description, error = %e, "Live query error");
          }),
        )
      },
      callback,
    )
  }

  pub fn registry(&self) -> &ListenerRegistry<Vec<Document>> {
    &self.registry
  }
}

impl<R: RemoteStore> Clone for LiveQueries<R> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
      registry: self.registry.clone(),
    }
  }
}
