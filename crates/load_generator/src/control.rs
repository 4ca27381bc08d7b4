//! The closed control loop: walk the span-change timeline, launching on
//! activation and replenishing on completion, so in-flight counts track
//! the staircase.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{
    invoker::Invoker,
    metrics,
    progress::Progress,
    spans::{
        span_changes,
        ScanSpan,
    },
};

#[derive(Debug)]
pub struct CompletionMessage {
    pub uuid: String,
}

pub struct ConcurrencyControl<I> {
    spans: Vec<ScanSpan>,
    invoker: I,
    completion_rx: mpsc::UnboundedReceiver<CompletionMessage>,
    progress: Arc<Progress>,
}

impl<I: Invoker> ConcurrencyControl<I> {
    pub fn new(
        spans: Vec<ScanSpan>,
        invoker: I,
        completion_rx: mpsc::UnboundedReceiver<CompletionMessage>,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            spans,
            invoker,
            completion_rx,
            progress,
        }
    }

    /// Run until the last span change has fired. Invocations belonging to
    /// deactivated spans are left to complete naturally; the sink tracks
    /// them after this returns.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let changes = span_changes(&self.spans);
        let start = tokio::time::Instant::now();
        // Span id -> end offset, for spans currently active.
        let mut active_span_ends: HashMap<usize, Duration> = HashMap::new();
        // Invocation uuid -> the span that launched it.
        let mut launched_by: HashMap<String, usize> = HashMap::new();
        let mut next_change = 0;

        while next_change < changes.len() {
            let change_at = start + changes[next_change].at;
            tokio::select! {
                Some(completion) = self.completion_rx.recv() => {
                    let Some(span) = launched_by.remove(&completion.uuid) else {
                        continue;
                    };
                    let Some(&end) = active_span_ends.get(&span) else {
                        continue;
                    };
                    let elapsed = start.elapsed();
                    if elapsed < end {
                        // Replace the finished invocation with the span's
                        // remaining budget.
                        self.launch(span, end - elapsed, &mut launched_by).await;
                    }
                },
                _ = tokio::time::sleep_until(change_at) => {
                    let change = changes[next_change];
                    if change.activate {
                        let span = self.spans[change.span];
                        tracing::info!(
                            "span {} active: launching {} invocations",
                            change.span,
                            span.concurrency,
                        );
                        let budget = span.end.saturating_sub(start.elapsed());
                        for _ in 0..span.concurrency {
                            self.launch(change.span, budget, &mut launched_by).await;
                        }
                        active_span_ends.insert(change.span, span.end);
                    } else {
                        tracing::info!("span {} over", change.span);
                        active_span_ends.remove(&change.span);
                    }
                    next_change += 1;
                },
            }
        }
        self.progress.set_invocation_done();
        Ok(())
    }

    async fn launch(
        &self,
        span: usize,
        budget: Duration,
        launched_by: &mut HashMap<String, usize>,
    ) {
        let uuid = self.progress.next_uuid();
        self.progress.set_invoked(&uuid);
        match self.invoker.invoke(&uuid, budget).await {
            Ok(()) => {
                metrics::log_launched();
                launched_by.insert(uuid, span);
            },
            Err(e) => {
                // No automatic retry; the slot just closes.
                metrics::log_launch_failed();
                tracing::error!("launching {uuid}: {e:#}");
                self.progress.set_failed(&uuid);
            },
        }
    }
}
