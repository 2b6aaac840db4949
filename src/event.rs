use catalog_sync::monitor::ConnectivityState;
use catalog_sync::resource::ResourceState;
use tokio::sync::{mpsc, watch};

/// Events driving the `watch` loop
#[derive(Debug)]
pub enum Event<T> {
  /// Visible state of the watched resource changed
  State(ResourceState<T>),
  /// Connectivity belief changed
  Connectivity(ConnectivityState),
  /// Ctrl-C
  Shutdown,
}

/// Merges resource changes, connectivity changes and Ctrl-C into one stream
pub struct EventHandler<T> {
  rx: mpsc::UnboundedReceiver<Event<T>>,
}

impl<T: Clone + Send + Sync + 'static> EventHandler<T> {
  pub fn new(
    mut states: watch::Receiver<ResourceState<T>>,
    mut connectivity: watch::Receiver<ConnectivityState>,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let state_tx = tx.clone();
    tokio::spawn(async move {
      while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        if state_tx.send(Event::State(state)).is_err() {
          break;
        }
      }
    });

    let connectivity_tx = tx.clone();
    tokio::spawn(async move {
      while connectivity.changed().await.is_ok() {
        let state = *connectivity.borrow_and_update();
        if connectivity_tx.send(Event::Connectivity(state)).is_err() {
          break;
        }
      }
    });

    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Shutdown);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event<T>> {
    self.rx.recv().await
  }
}
