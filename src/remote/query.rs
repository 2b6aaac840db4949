//! Query descriptors for remote reads and subscriptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Equality filter on a top-level document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  #[serde(default)]
  pub descending: bool,
}

/// Describes which documents of a collection a read or feed returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
  pub collection: String,
  #[serde(default)]
  pub filters: Vec<Filter>,
  #[serde(default)]
  pub order_by: Option<OrderBy>,
  #[serde(default)]
  pub limit: Option<usize>,
}

impl QueryDescriptor {
  pub fn new(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      filters: Vec::new(),
      order_by: None,
      limit: None,
    }
  }

  pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filters.push(Filter {
      field: field.into(),
      value: value.into(),
    });
    self
  }

  pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
    self.order_by = Some(OrderBy {
      field: field.into(),
      descending,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Stable, fixed-length identity of the query, independent of filter order.
  pub fn fingerprint(&self) -> String {
    let mut filters: Vec<String> = self
      .filters
      .iter()
      .map(|f| format!("{}={}", f.field.trim(), f.value))
      .collect();
    filters.sort();

    let input = format!(
      "{}|{}|{}|{}",
      self.collection.trim(),
      filters.join(","),
      self
        .order_by
        .as_ref()
        .map(|o| format!("{}:{}", o.field, if o.descending { "desc" } else { "asc" }))
        .unwrap_or_default(),
      self.limit.map(|l| l.to_string()).unwrap_or_default()
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    let mut out = self.collection.clone();
    if !self.filters.is_empty() {
      let clauses: Vec<String> = self
        .filters
        .iter()
        .map(|f| format!("{} == {}", f.field, f.value))
        .collect();
      out.push_str(&format!(" where {}", clauses.join(" and ")));
    }
    if let Some(order) = &self.order_by {
      out.push_str(&format!(
        " ordered by {}{}",
        order.field,
        if order.descending { " desc" } else { "" }
      ));
    }
    if let Some(limit) = self.limit {
      out.push_str(&format!(" limit {}", limit));
    }
    out
  }

  pub fn matches(&self, document: &Value) -> bool {
    self
      .filters
      .iter()
      .all(|f| document.get(&f.field) == Some(&f.value))
  }

  /// Evaluate the query against an in-memory collection.
  pub fn apply(&self, documents: &[Value]) -> Vec<Value> {
    let mut selected: Vec<Value> = documents
      .iter()
      .filter(|d| self.matches(d))
      .cloned()
      .collect();

    if let Some(order) = &self.order_by {
      selected.sort_by(|a, b| {
        let ord = compare_values(a.get(&order.field), b.get(&order.field));
        if order.descending {
          ord.reverse()
        } else {
          ord
        }
      });
    }

    if let Some(limit) = self.limit {
      selected.truncate(limit);
    }
    selected
  }
}

/// Missing fields sort first; numbers numerically, everything else by text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (None, None) => Ordering::Equal,
    (None, Some(_)) => Ordering::Less,
    (Some(_), None) => Ordering::Greater,
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
  }
}
