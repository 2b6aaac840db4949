use catalog_sync::cache::{ClearScope, Document, FallbackCache, NoopStore, SqliteStore};
use catalog_sync::config::Config;
use catalog_sync::monitor::{ConnectionMonitor, ConnectivityState};
use catalog_sync::probe::StoreProbe;
use catalog_sync::remote::{HttpRemoteStore, RemoteStore};
use catalog_sync::resource::{ResourceOrchestrator, ResourceState, SyncContext};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::event::{Event, EventHandler};

/// A document whose shape is only known to the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Document for Record {
  fn document_id(&self) -> Option<String> {
    self
      .0
      .get("id")
      .and_then(Value::as_str)
      .filter(|id| !id.is_empty())
      .map(str::to_string)
  }
}

type Records = Vec<Record>;

/// Wires the configured remote store, cache and monitor together
pub struct App {
  config: Config,
  ctx: SyncContext,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::new(&config.remote)?);

    let cache = if config.cache.enabled {
      let store = match &config.cache.path {
        Some(path) => SqliteStore::open_at(path)?,
        None => SqliteStore::open()?,
      };
      FallbackCache::new(store)
    } else {
      tracing::info!("Fallback cache disabled");
      FallbackCache::new(NoopStore)
    };
    for (key, payload) in &config.cache.defaults {
      cache.register_default(key, payload.clone());
    }

    let probe = Arc::new(StoreProbe::new(
      remote.clone(),
      &config.monitor.probe_collection,
    ));
    let monitor = ConnectionMonitor::new(
      probe,
      Duration::from_millis(config.monitor.probe_timeout_ms),
    );
    let policy = Arc::new(config.retry.to_policy()?);

    let ctx = SyncContext::new(remote, cache, monitor, policy);
    Ok(Self { config, ctx })
  }

  /// Follow one resource until Ctrl-C, printing a JSON line per change.
  pub async fn watch(&self, resource: &str) -> Result<()> {
    let query = self.config.resource(resource)?.clone();
    let orchestrator = ResourceOrchestrator::<Records>::start(&self.ctx, resource, query).await;

    let monitor = &self.ctx.monitor;
    monitor.start_periodic_check(Duration::from_secs(self.config.monitor.check_interval_secs));

    print_line(&connectivity_line(monitor.current()));
    print_line(&state_line(resource, &orchestrator.state()));

    let mut events = EventHandler::new(orchestrator.changes(), monitor.watch());
    while let Some(event) = events.next().await {
      match event {
        Event::State(state) => print_line(&state_line(resource, &state)),
        Event::Connectivity(state) => print_line(&connectivity_line(state)),
        Event::Shutdown => break,
      }
    }

    orchestrator.close();
    monitor.stop();
    tracing::info!(resource, "Stopped watching");
    Ok(())
  }

  pub async fn probe(&self) -> Result<()> {
    let state = self.ctx.monitor.check_now().await;
    print_line(&connectivity_line(state));
    Ok(())
  }

  pub fn cache_show(&self, resource: &str) -> Result<()> {
    let line = match self.ctx.cache.load::<Value>(resource) {
      Some(entry) => json!({
        "resource": resource,
        "source": "cache",
        "saved_at": entry.saved_at,
        "payload": entry.payload,
      }),
      None => json!({
        "resource": resource,
        "source": "default",
        "saved_at": Value::Null,
        "payload": self.ctx.cache.default_for::<Records>(resource),
      }),
    };
    print_line(&line);
    Ok(())
  }

  pub fn cache_clear(&self, resource: Option<&str>) -> Result<()> {
    let scope = match resource {
      Some(key) => ClearScope::Key(key.to_string()),
      None => ClearScope::All,
    };
    let before = self.ctx.cache.keys()?.len();
    self.ctx.cache.clear(&scope)?;
    let after = self.ctx.cache.keys()?.len();
    print_line(&json!({ "cleared": before.saturating_sub(after) }));
    Ok(())
  }
}

fn state_line(resource: &str, state: &ResourceState<Records>) -> Value {
  json!({
    "event": "state",
    "resource": resource,
    "source": state.source.as_str(),
    "stale": state.is_stale(),
    "loading": state.loading,
    "updated_at": state.updated_at,
    "error": state.connection_error.as_ref().map(|e| e.to_string()),
    "count": state.data.len(),
    "data": state.data,
  })
}

fn connectivity_line(state: ConnectivityState) -> Value {
  json!({ "event": "connectivity", "state": state })
}

fn print_line(value: &Value) {
  println!("{}", value);
}

#[cfg(test)]
mod tests {
  use super::*;
  use catalog_sync::cache::Resource;
  use catalog_sync::remote::WriteOp;

  fn record(value: Value) -> Record {
    serde_json::from_value(value).unwrap()
  }

  #[test]
  fn test_record_without_id_is_not_inserted_optimistically() {
    let mut records: Records = vec![record(json!({"id": "r1", "title": "First"}))];

    for document in [json!({"title": "No id"}), json!({"id": "", "title": "Empty"})] {
      assert!(!records.apply_optimistic(&WriteOp::Create {
        collection: "records".into(),
        document,
      }));
    }
    assert_eq!(records.len(), 1);

    assert!(records.apply_optimistic(&WriteOp::Create {
      collection: "records".into(),
      document: json!({"id": "r2", "title": "Second"}),
    }));
    assert_eq!(records[0].document_id().as_deref(), Some("r2"));
  }
}
