use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::{engine::Engine, meta::MetaData, store::StateStore};
use executor_execution::ExchangeGateway;

/// A component that can be torn down, returning a result describing how it
/// went (`spec.md` §5 "Shutdown is forced").
pub trait SyncShutdown {
    type Result;
    fn shutdown(&mut self) -> Self::Result;
}

/// Async counterpart to [`SyncShutdown`] for components whose teardown
/// itself needs to await (flushing, draining a queue).
pub trait AsyncShutdown {
    type Result;
    fn shutdown(&mut self) -> impl Future<Output = Self::Result>;
}

/// Marker value returned by a shutdown that has nothing further to report.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize,
)]
pub struct Shutdown;

/// How long to let the Trade Queue's in-flight task finish before the
/// worker is aborted outright (`spec.md` §5 "best-effort flush").
const QUEUE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Orchestrates a graceful shutdown (`spec.md` §5): flip the engine
/// non-operational so no further signal is accepted, let the Trade Queue's
/// in-flight tasks finish, then flush whatever is dirty.
pub struct GracefulShutdown<G, H> {
    engine: Engine<G, H>,
    store: Arc<StateStore>,
    meta: Arc<AsyncMutex<MetaData>>,
}

impl<G, H> GracefulShutdown<G, H>
where
    G: ExchangeGateway + 'static,
    H: crate::hub::HubClient + 'static,
{
    pub fn new(engine: Engine<G, H>, store: Arc<StateStore>) -> Self {
        let meta = engine.meta_handle();
        Self { engine, store, meta }
    }

    /// Block until `signal` completes, then hand the Trade Queue's join
    /// handle to [`AsyncShutdown::shutdown`].
    pub async fn run(
        self,
        signal: impl std::future::Future<Output = ()>,
        queue_worker: tokio::task::JoinHandle<()>,
    ) -> Shutdown {
        signal.await;
        tracing::info!("shutdown signal received, draining the trade queue");
        let mut handles = ShutdownHandles { shutdown: self, queue_worker: Some(queue_worker) };
        handles.shutdown().await
    }
}

/// Bundles a [`GracefulShutdown`] with the Trade Queue worker's join handle
/// so the teardown sequence can be expressed as a single [`AsyncShutdown`]
/// impl (`spec.md` §5).
struct ShutdownHandles<G, H> {
    shutdown: GracefulShutdown<G, H>,
    queue_worker: Option<tokio::task::JoinHandle<()>>,
}

impl<G, H> AsyncShutdown for ShutdownHandles<G, H>
where
    G: ExchangeGateway + 'static,
    H: crate::hub::HubClient + 'static,
{
    type Result = Shutdown;

    async fn shutdown(&mut self) -> Self::Result {
        {
            let mut meta = self.shutdown.meta.lock().await;
            meta.operational = false;
        }

        // No new work is enqueued once `operational` is false; give whatever
        // is already in flight a chance to finish, then abort the worker
        // loop outright, since its channel never closes while the engine
        // itself is still alive.
        tokio::time::sleep(QUEUE_DRAIN_GRACE).await;
        if let Some(queue_worker) = self.queue_worker.take() {
            queue_worker.abort();
        }

        let mut meta = self.shutdown.meta.lock().await;
        if let Err(error) = self.shutdown.store.flush_now(&mut meta).await {
            tracing::error!(%error, "best-effort flush during shutdown failed");
        }
        drop(meta);

        let _ = self.shutdown.engine.health().await;
        tracing::info!("shutdown complete");
        Shutdown
    }
}

/// Resolves once the process receives either ctrl-c or, on unix, SIGTERM
/// (`spec.md` §5 "a forced shutdown").
pub async fn terminate_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
