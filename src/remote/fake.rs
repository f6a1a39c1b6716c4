//! In-memory remote store for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Document, ErrorFn, FilterOp, QueryDescriptor, RemoteStore, UpdateFn};
use crate::listener::Teardown;

struct FakeSubscription {
  query: QueryDescriptor,
  on_update: UpdateFn,
  on_error: ErrorFn,
  open: Arc<AtomicBool>,
}

#[derive(Default)]
pub(crate) struct FakeRemote {
  collections: Mutex<HashMap<String, Vec<Document>>>,
  subscriptions: Mutex<Vec<FakeSubscription>>,
  pub(crate) queries: AtomicUsize,
  pub(crate) subscribes: AtomicUsize,
  pub(crate) failing: AtomicBool,
}

impl FakeRemote {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub(crate) fn insert(&self, collection: &str, document: Document) {
    self
      .collections
      .lock()
      .unwrap()
      .entry(collection.to_string())
      .or_default()
      .push(document);
  }

  /// Re-run every open subscription on `collection` and push the results.
  pub(crate) fn notify(&self, collection: &str) {
    let subscriptions = self.subscriptions.lock().unwrap();
    for subscription in subscriptions.iter() {
      if subscription.query.collection == collection && subscription.open.load(Ordering::SeqCst) {
        (subscription.on_update)(self.evaluate(&subscription.query));
      }
    }
  }

  pub(crate) fn open_subscriptions(&self) -> usize {
    self
      .subscriptions
      .lock()
      .unwrap()
      .iter()
      .filter(|subscription| subscription.open.load(Ordering::SeqCst))
      .count()
  }

  /// Report `message` on every open subscription.
  pub(crate) fn fail_subscriptions(&self, message: &str) {
    let subscriptions = self.subscriptions.lock().unwrap();
    for subscription in subscriptions.iter() {
      if subscription.open.load(Ordering::SeqCst) {
        (subscription.on_error)(eyre!("{}", message));
      }
    }
  }

  fn evaluate(&self, query: &QueryDescriptor) -> Vec<Document> {
    let collections = self.collections.lock().unwrap();
    let mut documents: Vec<Document> = collections
      .get(&query.collection)
      .map(|documents| {
        documents
          .iter()
          .filter(|document| {
            query.filters.iter().all(|filter| match filter.op {
              FilterOp::Eq => document.field(&filter.field).as_ref() == Some(&filter.value),
              _ => true,
            })
          })
          .cloned()
          .collect()
      })
      .unwrap_or_default();

    if let Some(limit) = query.limit {
      documents.truncate(limit as usize);
    }
    documents
  }
}

impl RemoteStore for FakeRemote {
  async fn query(&self, query: &QueryDescriptor) -> Result<Vec<Document>> {
    self.queries.fetch_add(1, Ordering::SeqCst);
    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("backend unavailable"));
    }
    Ok(self.evaluate(query))
  }

  fn subscribe(&self, query: QueryDescriptor, on_update: UpdateFn, on_error: ErrorFn) -> Teardown {
    self.subscribes.fetch_add(1, Ordering::SeqCst);
    let open = Arc::new(AtomicBool::new(true));
    self.subscriptions.lock().unwrap().push(FakeSubscription {
      query,
      on_update,
      on_error,
      open: Arc::clone(&open),
    });

    Box::new(move || open.store(false, Ordering::SeqCst))
  }
}
