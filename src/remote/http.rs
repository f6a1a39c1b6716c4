//! HTTP client for the remote document backend.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use url::Url;

use super::{Document, ErrorFn, QueryDescriptor, RemoteStore, UpdateFn};
use crate::listener::Teardown;

#[derive(Debug, Deserialize)]
struct QueryResponse {
  #[serde(default)]
  documents: Vec<Document>,
}

/// Remote store reached over HTTP.
///
/// Queries are POSTed as JSON to `<base_url>/v1/query`. Subscriptions poll
/// the same endpoint and only report result sets that changed.
#[derive(Clone)]
pub struct HttpRemoteStore {
  client: reqwest::Client,
  query_url: Url,
  token: Option<String>,
  poll_interval: Duration,
}

impl HttpRemoteStore {
  pub fn new(base_url: &str, token: Option<String>, poll_interval: Duration) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid remote base URL '{}': {}", base_url, e))?;

    // Without a trailing slash `join` would replace the last path segment
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let query_url = base
      .join("v1/query")
      .map_err(|e| eyre!("Invalid remote base URL '{}': {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .user_agent(concat!("bookclub/", env!("CARGO_PKG_VERSION")))
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      query_url,
      token,
      poll_interval,
    })
  }

  pub fn query_url(&self) -> &Url {
    &self.query_url
  }
}

impl RemoteStore for HttpRemoteStore {
  async fn query(&self, query: &QueryDescriptor) -> Result<Vec<Document>> {
    let mut request = self.client.post(self.query_url.clone()).json(query);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Query on '{}' failed: {}", query.collection, e))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(eyre!(
        "Query on '{}' returned {}: {}",
        query.collection,
        status,
        body.trim()
      ));
    }

    let parsed: QueryResponse = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse query response for '{}': {}", query.collection, e))?;

    debug!(query = %query.description(), count = parsed.documents.len(), "Query completed");
    Ok(parsed.documents)
  }

  /// Poll `query` until the teardown runs. Must be called within a tokio runtime.
  fn subscribe(&self, query: QueryDescriptor, on_update: UpdateFn, on_error: ErrorFn) -> Teardown {
    let store = self.clone();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(store.poll_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut last: Option<Vec<Document>> = None;

      loop {
        ticker.tick().await;
        match store.query(&query).await {
          Ok(documents) => {
            if last.as_ref() != Some(&documents) {
              last = Some(documents.clone());
              on_update(documents);
            }
          }
          Err(e) => on_error(e),
        }
      }
    });

    Box::new(move || handle.abort())
  }
}
