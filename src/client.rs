//! Cached backend client that routes reads through the cache and live queries
//! through the listener registry.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use crate::cache::{keys, CacheService, DurableStore};
use crate::listener::{ListenerRegistry, Subscription};
use crate::remote::{Document, LiveQueries, QueryDescriptor, RemoteStore, DOCUMENT_ID};

/// Backend client with transparent caching and shared live queries.
///
/// Reads are served by [`CacheService::get_or_fetch`] under the well-known
/// keys in [`keys`]; writes happen elsewhere and must call the matching
/// `invalidate_*` method.
pub struct CachedClient<R: RemoteStore, S: DurableStore> {
  remote: Arc<R>,
  cache: CacheService<S>,
  live: LiveQueries<R>,
  ttl: Duration,
}

impl<R: RemoteStore, S: DurableStore> CachedClient<R, S> {
  pub fn new(
    remote: Arc<R>,
    cache: CacheService<S>,
    listeners: ListenerRegistry<Vec<Document>>,
    ttl: Duration,
  ) -> Self {
    let live = LiveQueries::new(Arc::clone(&remote), listeners);
    Self {
      remote,
      cache,
      live,
      ttl,
    }
  }

  pub fn cache(&self) -> &CacheService<S> {
    &self.cache
  }

  pub fn live(&self) -> &LiveQueries<R> {
    &self.live
  }

  async fn cached_query(&self, key: &str, query: QueryDescriptor) -> Result<Vec<Document>> {
    let remote = Arc::clone(&self.remote);
    self
      .cache
      .get_or_fetch(key, || async move { remote.query(&query).await }, self.ttl)
      .await
  }

  async fn cached_document(&self, key: &str, collection: &str, id: &str) -> Result<Document> {
    let remote = Arc::clone(&self.remote);
    let query = QueryDescriptor::collection(collection)
      .where_eq(DOCUMENT_ID, id)
      .limit(1);
    let missing = format!("No document '{}' in {}", id, collection);

    self
      .cache
      .get_or_fetch(
        key,
        || async move {
          remote
            .query(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| eyre!(missing))
        },
        self.ttl,
      )
      .await
  }

  /// Events hosted by `user_id`, or all events.
  pub async fn events(&self, user_id: Option<&str>) -> Result<Vec<Document>> {
    let query = match user_id {
      Some(user_id) => QueryDescriptor::collection("events").where_eq("hostId", user_id),
      None => QueryDescriptor::collection("events"),
    }
    .order_by("date", false);

    self.cached_query(&keys::events(user_id), query).await
  }

  pub async fn event_details(&self, event_id: &str) -> Result<Document> {
    self
      .cached_document(&keys::event_details(event_id), "events", event_id)
      .await
  }

  pub async fn user_profile(&self, user_id: &str) -> Result<Document> {
    self
      .cached_document(&keys::user_profile(user_id), "users", user_id)
      .await
  }

  /// Comments on an event, oldest first.
  pub async fn comments(&self, event_id: &str) -> Result<Vec<Document>> {
    let query = QueryDescriptor::collection("comments")
      .where_eq("eventId", event_id)
      .order_by("createdAt", false);
    self.cached_query(&keys::comments(event_id), query).await
  }

  /// Drop every cached entry that may include `event_id`.
  pub async fn invalidate_event(&self, event_id: &str, owner: Option<&str>) {
    self
      .cache
      .remove_many(keys::event_invalidation(event_id, owner))
      .await;
  }

  pub async fn invalidate_user_profile(&self, user_id: &str) {
    self.cache.remove(&keys::user_profile(user_id)).await;
  }

  /// Live pending friend requests addressed to `user_id`.
  pub fn watch_incoming_friend_requests<F>(&self, user_id: &str, callback: F) -> Subscription
  where
    F: Fn(&Vec<Document>) + Send + Sync + 'static,
  {
    let query = QueryDescriptor::collection("friend_requests")
      .where_eq("toUserId", user_id)
      .where_eq("status", "pending");
    self
      .live
      .watch_keyed(&keys::incoming_friend_requests(user_id), &query, callback)
  }

  /// Live results of an arbitrary query.
  pub fn watch<F>(&self, query: &QueryDescriptor, callback: F) -> Subscription
  where
    F: Fn(&Vec<Document>) + Send + Sync + 'static,
  {
    self.live.watch(query, callback)
  }
}

impl<R: RemoteStore, S: DurableStore> Clone for CachedClient<R, S> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
      cache: self.cache.clone(),
      live: self.live.clone(),
      ttl: self.ttl,
    }
  }
}
