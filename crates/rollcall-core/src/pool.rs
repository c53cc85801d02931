//! Bounded-concurrency execution of fetch tasks.

use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::FailureKind;
use crate::fetcher::RetryingFetcher;
use crate::ids::EntityId;
use crate::record::FetchOutcome;
use crate::traits::PortalClient;

/// Runs one fetch per entity with at most `concurrency` in flight.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    /// A concurrency of zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns a stream of outcomes in completion order.
    ///
    /// Each fetch runs in its own tokio task, so a panicking fetch becomes a
    /// permanent failure for that entity only. Once `cancel` fires no further
    /// tasks are started; the stream ends after the in-flight ones finish.
    /// Without cancellation the stream yields exactly one outcome per task.
    pub fn run_all<P: PortalClient>(
        &self,
        tasks: Vec<EntityId>,
        fetcher: RetryingFetcher<P>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = FetchOutcome> + Send + use<P> {
        stream::iter(tasks)
            .take_while(move |_| std::future::ready(!cancel.is_cancelled()))
            .map(move |id| {
                let fetcher = fetcher.clone();
                async move {
                    let entity = id.clone();
                    let handle = tokio::spawn(async move { fetcher.fetch(id).await });
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(entity = %entity, error = %e, "Fetch task aborted");
                            FetchOutcome::failed(
                                entity,
                                FailureKind::Permanent,
                                format!("fetch task aborted: {}", e),
                                0,
                            )
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
    }
}
