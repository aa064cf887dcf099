use super::material::MaterialSnapshot;
use crate::error::{Error, Result};
use crate::identity::IdentitySource;
use crate::prelude::{debug, error, info};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Access to the current material snapshot.
///
/// Verifiers and resolvers only see this trait so they can be tested without a
/// running watcher.
pub(crate) trait MaterialProvider: Send + Sync {
    fn current_material(&self) -> Arc<MaterialSnapshot>;
}

/// Keeps a current snapshot of rustls material and refreshes it on rotation.
#[derive(Clone, Debug)]
pub(crate) struct MaterialWatcher {
    rx: watch::Receiver<Arc<MaterialSnapshot>>,
    _guard: Arc<WatcherGuard>,
}

#[derive(Debug)]
struct WatcherGuard {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl MaterialWatcher {
    /// Builds the initial snapshot and spawns the refresh task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// ## Errors
    ///
    /// Fails if the source holds no document yet or the initial material
    /// cannot be built.
    pub(crate) fn spawn(source: IdentitySource) -> Result<Self> {
        let mut updates = source.updated();
        let initial = MaterialSnapshot::from_document(&*source.current()?, updates.last())?;
        let (tx, rx) = watch::channel(Arc::new(initial));

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("material watcher cancelled; stopping");
                        break;
                    }

                    res = updates.changed() => {
                        let generation = match res {
                            Ok(generation) => generation,
                            Err(e) => {
                                info!("identity source stopped ({e}); stopping material watcher");
                                break;
                            }
                        };

                        let rebuilt = source
                            .current()
                            .map_err(Error::from)
                            .and_then(|document| MaterialSnapshot::from_document(&document, generation));

                        match rebuilt {
                            Ok(material) => {
                                debug!(
                                    "updated rustls material: spiffe_id={}, generation={generation}",
                                    material.spiffe_id
                                );
                                let _ = tx.send(Arc::new(material));
                            }
                            Err(e) => {
                                error!("failed rebuilding rustls material; keeping previous: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            rx,
            _guard: Arc::new(WatcherGuard { cancel, task }),
        })
    }

    pub(crate) fn current(&self) -> Arc<MaterialSnapshot> {
        self.rx.borrow().clone()
    }
}

impl MaterialProvider for MaterialWatcher {
    fn current_material(&self) -> Arc<MaterialSnapshot> {
        self.current()
    }
}
