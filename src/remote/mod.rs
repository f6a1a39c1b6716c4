//! Interface to the remote document backend.
//!
//! The backend is opaque: a one-shot `query` and a long-lived `subscribe`
//! over a [`QueryDescriptor`]. Caching and subscription sharing live on top of
//! this trait, never inside an implementation of it.

#[cfg(test)]
pub(crate) mod fake;
mod http;
mod live;

use color_eyre::{Report, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;

use crate::listener::Teardown;

pub use http::HttpRemoteStore;
pub use live::LiveQueries;

/// Pseudo-field that filters on the document id.
pub const DOCUMENT_ID: &str = "__name__";

/// Receives each new result set of a subscription.
pub type UpdateFn = Box<dyn Fn(Vec<Document>) + Send + Sync>;

/// Receives errors from a subscription. The subscription stays open.
pub type ErrorFn = Box<dyn Fn(Report) + Send + Sync>;

/// The remote document store.
pub trait RemoteStore: Send + Sync + 'static {
  /// Run `query` once.
  fn query(&self, query: &QueryDescriptor) -> impl Future<Output = Result<Vec<Document>>> + Send;

  /// Open a long-lived subscription to `query`.
  ///
  /// `on_update` receives every new result set; `on_error` receives
  /// transport failures without ending the subscription. The returned
  /// teardown closes it.
  fn subscribe(&self, query: QueryDescriptor, on_update: UpdateFn, on_error: ErrorFn) -> Teardown;
}

/// A document returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  #[serde(default)]
  pub data: Value,
}

impl Document {
  pub fn new(id: impl Into<String>, data: Value) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }

  /// A top-level field of the document, with [`DOCUMENT_ID`] resolving to the id.
  pub fn field(&self, name: &str) -> Option<Value> {
    if name == DOCUMENT_ID {
      return Some(Value::String(self.id.clone()));
    }
    self.data.get(name).cloned()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
  Eq,
  NotEq,
  Lt,
  Lte,
  Gt,
  Gte,
  ArrayContains,
  In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  #[serde(default)]
  pub descending: bool,
}

/// Describes one query against a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
  pub collection: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub filters: Vec<Filter>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub order_by: Option<OrderBy>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limit: Option<u32>,
}

impl QueryDescriptor {
  /// Query every document in `collection`.
  pub fn collection(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      filters: Vec::new(),
      order_by: None,
      limit: None,
    }
  }

  pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
    self.filters.push(Filter {
      field: field.into(),
      op,
      value: value.into(),
    });
    self
  }

  pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter(field, FilterOp::Eq, value)
  }

  pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
    self.order_by = Some(OrderBy {
      field: field.into(),
      descending,
    });
    self
  }

  pub fn limit(mut self, limit: u32) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Stable identifier for this query, equal for equal descriptors.
  pub fn fingerprint(&self) -> String {
    // Field order is fixed by the struct and JSON objects serialize sorted
    let canonical = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable summary for logs.
  pub fn description(&self) -> String {
    let mut description = self.collection.clone();
    for filter in &self.filters {
      description.push_str(&format!(" {} {:?} {}", filter.field, filter.op, filter.value));
    }
    if let Some(order) = &self.order_by {
      description.push_str(&format!(
        " order by {}{}",
        order.field,
        if order.descending { " desc" } else { "" }
      ));
    }
    if let Some(limit) = self.limit {
      description.push_str(&format!(" limit {}", limit));
    }
    description
  }
}
