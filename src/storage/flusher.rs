//! Background flush worker for a storage context.
//!
//! Dirty stores are flushed on a fixed tick so that a crash loses at most one
//! interval of changes. The worker is a plain thread; it sleeps on a
//! crossbeam `tick` channel and exits as soon as its shutdown channel is
//! signalled or dropped.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::storage::context::{save_all, Registry};

/// Handle of a running flush worker. Dropping it stops the worker.
pub struct Flusher {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Spawns a worker flushing every store in `stores` each `interval`.
    pub(crate) fn start(context: String, stores: Registry, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(format!("syncstore-flush-{}", context))
            .spawn(move || {
                info!(
                    "Starting periodic flusher for {} with interval: {:?}",
                    context, interval
                );
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            match save_all(&stores) {
                                Ok(0) => {}
                                Ok(written) => {
                                    debug!(
                                        "Periodic flush of {} wrote {} records",
                                        context, written
                                    );
                                }
                                Err(e) => {
                                    warn!("Periodic flush of {} failed: {}", context, e);
                                }
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("Flusher for {} stopped", context);
            });

        match handle {
            Ok(handle) => Self {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("Failed to spawn flusher thread: {}", e);
                Self {
                    shutdown: None,
                    handle: None,
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the worker and waits for it to exit.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Flusher thread panicked");
            }
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{of_int, of_string};
    use crate::storage::{StorageConfig, StorageContext, StorageHint};
    use tempfile::TempDir;

    #[test]
    fn test_periodic_flush_drains_overlay() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            flush_interval_ms: 20,
            ..StorageConfig::persistent(temp_dir.path())
        };
        let ctx = StorageContext::open("flusher", config).unwrap();
        let store = ctx
            .create_kv_store::<i32, String>("names", StorageHint::UsePagedStore)
            .with_key_codec(of_int())
            .with_value_codec(of_string())
            .build()
            .unwrap();

        store.put(1, "one".to_string()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.dirty_len() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.dirty_len(), 0);
        assert_eq!(store.get(&1).unwrap(), Some("one".to_string()));
    }

    #[test]
    fn test_stop_joins_worker() {
        let mut flusher = Flusher::start(
            "idle".to_string(),
            Registry::default(),
            Duration::from_millis(5),
        );
        assert!(flusher.is_running());
        flusher.stop();
        assert!(!flusher.is_running());
    }
}
