use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

use super::{QueryDescriptor, RemoteSnapshot, RemoteStore, WriteAck, WriteOp};
use crate::config::{Config, RemoteConfig};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Deserialize)]
struct DocumentsResponse {
  documents: Vec<Value>,
  #[serde(rename = "readTime")]
  read_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct WriteResponse {
  id: Option<String>,
  #[serde(rename = "commitTime")]
  commit_time: Option<DateTime<Utc>>,
}

/// Document store client speaking JSON over HTTP.
///
/// Live feeds are emulated by polling; a snapshot is only emitted when the
/// returned documents change.
#[derive(Clone)]
pub struct HttpRemoteStore {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
  timeout: Duration,
  poll_interval: Duration,
}

impl HttpRemoteStore {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote store URL {}: {}", config.url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Remote store URL cannot be a base: {}", config.url));
    }

    let timeout = Duration::from_millis(config.timeout_ms);
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::get_api_token(),
      timeout,
      poll_interval: Duration::from_millis(config.poll_interval_ms),
    })
  }

  /// `{base}/collections/{collection}/documents[/{id}]`
  fn documents_url(&self, collection: &str, id: Option<&str>) -> StoreResult<Url> {
    let mut url = self.base_url.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| StoreError::Rejected("base URL cannot hold a path".into()))?;
      segments
        .pop_if_empty()
        .extend(["collections", collection, "documents"]);
      if let Some(id) = id {
        segments.push(id);
      }
    }
    Ok(url)
  }

  fn query_url(&self, query: &QueryDescriptor) -> StoreResult<Url> {
    let mut url = self.documents_url(&query.collection, None)?;
    {
      let mut pairs = url.query_pairs_mut();
      for filter in &query.filters {
        let value = match &filter.value {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        pairs.append_pair(&filter.field, &value);
      }
      if let Some(order) = &query.order_by {
        let field = if order.descending {
          format!("-{}", order.field)
        } else {
          order.field.clone()
        };
        pairs.append_pair("orderBy", &field);
      }
      if let Some(limit) = query.limit {
        pairs.append_pair("limit", &limit.to_string());
      }
    }
    Ok(url)
  }

  async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> StoreResult<String> {
    let mut request = self.client.request(method, url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| self.transport_error(e))?;
    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| self.transport_error(e))?;

    if status.is_success() {
      Ok(text)
    } else {
      Err(status_error(status, &text))
    }
  }

  fn transport_error(&self, e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
      StoreError::Timeout(self.timeout)
    } else if e.is_decode() {
      StoreError::Malformed(e.to_string())
    } else {
      StoreError::Unavailable(e.to_string())
    }
  }
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
  let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied(detail),
    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => StoreError::Unavailable(detail),
    s if s.is_server_error() => StoreError::Unavailable(detail),
    _ => StoreError::Rejected(detail),
  }
}

/// Body of a document listing: `{"documents": [...], "readTime": "..."}`.
fn parse_documents(body: &str) -> StoreResult<RemoteSnapshot> {
  let response: DocumentsResponse = serde_json::from_str(body)?;
  Ok(RemoteSnapshot {
    documents: Value::Array(response.documents),
    read_at: response.read_time.unwrap_or_else(Utc::now),
  })
}

/// Write acknowledgment. Updates and deletes may answer with an empty body,
/// in which case the id the caller addressed is used.
fn parse_ack(body: &str, known_id: Option<String>) -> StoreResult<WriteAck> {
  let response: WriteResponse = if body.trim().is_empty() {
    WriteResponse::default()
  } else {
    serde_json::from_str(body)?
  };

  let id = response
    .id
    .or(known_id)
    .ok_or_else(|| StoreError::Malformed("write acknowledgment carried no id".into()))?;
  Ok(WriteAck {
    id,
    committed_at: response.commit_time.unwrap_or_else(Utc::now),
  })
}

/// SHA256 over the serialized documents, for change detection between polls.
fn digest(documents: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(documents.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

/// Turns raw poll results into feed items.
#[derive(Debug, Default)]
struct ChangeFilter {
  last_digest: Option<String>,
}

impl ChangeFilter {
  /// Snapshots identical to the last delivered one are dropped. Errors always
  /// pass and forget the last digest, so the first good poll after an error
  /// is delivered even if nothing changed.
  fn observe(
    &mut self,
    polled: StoreResult<RemoteSnapshot>,
  ) -> Option<StoreResult<RemoteSnapshot>> {
    match polled {
      Ok(snapshot) => {
        let digest = digest(&snapshot.documents);
        if self.last_digest.as_deref() == Some(digest.as_str()) {
          return None;
        }
        self.last_digest = Some(digest);
        Some(Ok(snapshot))
      }
      Err(e) => {
        self.last_digest = None;
        Some(Err(e))
      }
    }
  }
}

struct PollState {
  store: HttpRemoteStore,
  query: QueryDescriptor,
  changes: ChangeFilter,
  first: bool,
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn read(&self, query: &QueryDescriptor) -> StoreResult<RemoteSnapshot> {
    let url = self.query_url(query)?;
    let body = self.send(Method::GET, url, None).await?;
    parse_documents(&body)
  }

  fn subscribe(&self, query: &QueryDescriptor) -> BoxStream<'static, StoreResult<RemoteSnapshot>> {
    let state = PollState {
      store: self.clone(),
      query: query.clone(),
      changes: ChangeFilter::default(),
      first: true,
    };

    stream::unfold(state, |mut state| async move {
      loop {
        if !state.first {
          tokio::time::sleep(state.store.poll_interval).await;
        }
        state.first = false;

        let polled = state.store.read(&state.query).await;
        if let Some(item) = state.changes.observe(polled) {
          return Some((item, state));
        }
      }
    })
    .boxed()
  }

  async fn write(&self, op: &WriteOp) -> StoreResult<WriteAck> {
    let (method, url, body, known_id) = match op {
      WriteOp::Create {
        collection,
        document,
      } => (
        Method::POST,
        self.documents_url(collection, None)?,
        Some(document),
        None,
      ),
      WriteOp::Update {
        collection,
        id,
        fields,
      } => (
        Method::PATCH,
        self.documents_url(collection, Some(id.as_str()))?,
        Some(fields),
        Some(id.clone()),
      ),
      WriteOp::Delete { collection, id } => (
        Method::DELETE,
        self.documents_url(collection, Some(id.as_str()))?,
        None,
        Some(id.clone()),
      ),
    };

    let text = self.send(method, url, body).await?;
    parse_ack(&text, known_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store(url: &str) -> HttpRemoteStore {
    HttpRemoteStore::new(&RemoteConfig {
      url: url.to_string(),
      ..RemoteConfig::default()
    })
    .unwrap()
  }

  #[test]
  fn test_query_url_encodes_filters_order_and_limit() {
    let store = store("https://store.example.com/api/");
    let query = QueryDescriptor::new("products")
      .where_eq("category", "garden tools")
      .where_eq("active", true)
      .order_by("price", true)
      .limit(25);

    let url = store.query_url(&query).unwrap();
    assert_eq!(
      url.as_str(),
      "https://store.example.com/api/collections/products/documents?category=garden+tools&active=true&orderBy=-price&limit=25"
    );
  }

  #[test]
  fn test_document_url_escapes_id() {
    let store = store("https://store.example.com");
    let url = store.documents_url("licenses", Some("a/b")).unwrap();
    assert_eq!(
      url.as_str(),
      "https://store.example.com/collections/licenses/documents/a%2Fb"
    );
  }

  #[test]
  fn test_status_classification() {
    assert!(matches!(
      status_error(StatusCode::FORBIDDEN, ""),
      StoreError::PermissionDenied(_)
    ));
    assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
    assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
    assert!(matches!(
      status_error(StatusCode::NOT_FOUND, "gone"),
      StoreError::Rejected(_)
    ));
  }

  fn polled(documents: Value) -> StoreResult<RemoteSnapshot> {
    Ok(RemoteSnapshot {
      documents,
      read_at: Utc::now(),
    })
  }

  #[test]
  fn test_change_filter_skips_unchanged_and_redelivers_after_error() {
    let mut changes = ChangeFilter::default();
    let a = json!([{"id": "p1", "name": "Lamp"}]);

    assert!(matches!(changes.observe(polled(a.clone())), Some(Ok(_))));
    assert!(changes.observe(polled(a.clone())).is_none());

    let error = StoreError::Unavailable("HTTP 503".into());
    assert_eq!(changes.observe(Err(error.clone())), Some(Err(error.clone())));
    assert_eq!(changes.observe(Err(error.clone())), Some(Err(error)));

    // Same documents as before the outage, delivered again once
    let recovered = changes.observe(polled(a.clone())).unwrap().unwrap();
    assert_eq!(recovered.documents, a);
    assert!(changes.observe(polled(a)).is_none());

    let b = json!([{"id": "p1", "name": "Desk"}]);
    assert!(matches!(changes.observe(polled(b)), Some(Ok(_))));
  }

  #[test]
  fn test_parse_documents_uses_read_time() {
    let snapshot = parse_documents(
      r#"{"documents": [{"id": "p1"}], "readTime": "2024-05-01T12:00:00Z"}"#,
    )
    .unwrap();
    assert_eq!(snapshot.documents, json!([{"id": "p1"}]));
    assert_eq!(snapshot.read_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");

    let before = Utc::now();
    let snapshot = parse_documents(r#"{"documents": []}"#).unwrap();
    assert!(snapshot.read_at >= before);

    assert!(matches!(
      parse_documents(r#"{"items": []}"#),
      Err(StoreError::Malformed(_))
    ));
    assert!(matches!(
      parse_documents("<html>"),
      Err(StoreError::Malformed(_))
    ));
  }

  #[test]
  fn test_parse_ack_falls_back_to_addressed_id() {
    let ack = parse_ack(
      r#"{"id": "doc-7", "commitTime": "2024-05-01T12:00:00Z"}"#,
      None,
    )
    .unwrap();
    assert_eq!(ack.id, "doc-7");
    assert_eq!(ack.committed_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");

    assert_eq!(parse_ack("", Some("p1".into())).unwrap().id, "p1");
    assert_eq!(parse_ack("  \n", Some("p1".into())).unwrap().id, "p1");
    assert_eq!(parse_ack("{}", Some("p1".into())).unwrap().id, "p1");

    assert!(matches!(parse_ack("", None), Err(StoreError::Malformed(_))));
    assert!(matches!(
      parse_ack("not json", Some("p1".into())),
      Err(StoreError::Malformed(_))
    ));
  }

  #[test]
  fn test_invalid_url_is_rejected() {
    let result = HttpRemoteStore::new(&RemoteConfig {
      url: "not a url".to_string(),
      ..RemoteConfig::default()
    });
    assert!(result.is_err());
  }
}
