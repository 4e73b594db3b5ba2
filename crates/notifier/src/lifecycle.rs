use crate::senders::Registry;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Worker is a unit of work which runs until signaled to stop.
pub trait Worker: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run this Worker until `shutdown` is cancelled. Workers observe
    /// `shutdown` between iterations, and must finish (or safely re-queue)
    /// the item they're handling before returning.
    fn run(self, shutdown: CancellationToken) -> impl Future<Output = ()> + Send + 'static;
}

/// Coordinator starts Workers as independent tasks which share one
/// shutdown signal and one completion barrier.
pub struct Coordinator {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Start `worker` on its own task.
    pub fn spawn<W: Worker>(&self, worker: W) {
        let name = worker.name();
        let run = worker.run(self.shutdown.clone());

        self.tracker.spawn(async move {
            tracing::info!(worker = name, "worker started");
            () = run.await;
            tracing::info!(worker = name, "worker stopped");
        });
    }

    /// Number of Workers which have not yet stopped.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Serve until `signal` resolves, and then broadcast shutdown, await the
    /// exit of every Worker, and finally shut down `senders`.
    pub async fn serve(self, signal: impl Future<Output = ()>, senders: &Registry) {
        tokio::select! {
            () = signal => tracing::info!("caught shutdown signal, stopping workers..."),
            () = self.shutdown.cancelled() => {
                tracing::info!("shutdown requested, stopping workers...")
            }
        }
        self.shutdown.cancel();

        self.tracker.close();
        () = self.tracker.wait().await;

        () = senders.shutdown().await;
        tracing::info!("all workers stopped and senders shut down");
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
