//! Work item consumer.
//!
//! Every child is registered against its job before it is published, so no
//! consumer can complete a child whose increment has not landed yet. That
//! ordering is what keeps a job's count from touching zero early.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::{DispatchConfig, finalize_if_finished};
use crate::error::{Error, Result};
use crate::job::JobCounter;
use crate::model::{Document, FaultMessage, WorkData, WorkItem};
use crate::queue::{CHILD_PRIORITY, Delivery, ROOT_PRIORITY, WorkQueue, publish_message};
use crate::store::{BlobStore, DocumentStore, MemoryBlobStore, MemoryDocumentStore};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_dispatch_span};
use crate::worker::WorkerUnit;

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Processed and completed against its job.
    Completed { children: usize, finalized: bool },
    /// Failed after registration; handed to the fault queue.
    Faulted,
    /// Failed before registration; returned to the queue.
    Retry,
    /// Undecodable body; dropped.
    Poison,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Faulted => "faulted",
            Self::Retry => "retry",
            Self::Poison => "poison",
        }
    }
}

struct Failure {
    /// The item had been counted against its job when this happened.
    registered: bool,
    error: Error,
}

impl Failure {
    fn unregistered(error: Error) -> Self {
        Self {
            registered: false,
            error,
        }
    }

    fn registered(error: Error) -> Self {
        Self {
            registered: true,
            error,
        }
    }
}

struct Transitions<'a> {
    span: &'a Span,
    state: &'static str,
}

impl Transitions<'_> {
    fn to(&mut self, next: &'static str) {
        record_state_transition(self.span, self.state, next);
        self.state = next;
    }
}

pub struct WorkDispatcher<P, M> {
    counter: Arc<dyn JobCounter>,
    queue: Arc<dyn WorkQueue>,
    workers: Arc<[Arc<dyn WorkerUnit<P, M>>]>,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    config: DispatchConfig,
    shutdown: Arc<Notify>,
}

impl<P, M> Clone for WorkDispatcher<P, M> {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            queue: Arc::clone(&self.queue),
            workers: Arc::clone(&self.workers),
            documents: Arc::clone(&self.documents),
            blobs: Arc::clone(&self.blobs),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<P: WorkData, M: WorkData> WorkDispatcher<P, M> {
    /// Dispatcher writing side effects to in-memory stores until
    /// [`with_documents`](Self::with_documents) / [`with_blobs`](Self::with_blobs)
    /// say otherwise.
    pub fn new(
        counter: Arc<dyn JobCounter>,
        queue: Arc<dyn WorkQueue>,
        workers: Vec<Arc<dyn WorkerUnit<P, M>>>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            counter,
            queue,
            workers: workers.into(),
            documents: Arc::new(MemoryDocumentStore::default()),
            blobs: Arc::new(MemoryBlobStore::new()),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Signal [`run`](Self::run) to stop taking deliveries.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Consume deliveries until shutdown, up to `max_concurrent` at a time.
    /// In-flight deliveries are finished before returning.
    pub async fn run(&self) -> Result<()> {
        self.queue.ensure_queue(&self.config.in_queue).await?;
        self.queue.ensure_queue(&self.config.fault_queue).await?;

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        info!(
            queue = %self.config.in_queue,
            backend = self.queue.backend(),
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("dispatch task panicked: {e}");
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.notified() => break,
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.map_err(|e| Error::Other(format!("dispatch semaphore closed: {e}")))?
                }
            };

            let received = tokio::select! {
                _ = self.shutdown.notified() => break,
                received = self.queue.receive(&self.config.in_queue) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let this = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = this.handle(delivery).await {
                            error!(error = %e, "dispatch failed; message left for redelivery");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "receive failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "dispatcher shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("dispatch task panicked: {e}");
            }
        }
        Ok(())
    }

    /// Receive and handle a single delivery. `None` when nothing is visible.
    pub async fn process_next(&self) -> Result<Option<DispatchOutcome>> {
        match self.queue.receive(&self.config.in_queue).await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle deliveries one at a time until the queue shows nothing
    /// visible. Returns how many were handled.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut handled = 0;
        while self.process_next().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// Handle one delivery and settle it with the queue: ack when completed
    /// or faulted, nack when it failed before being counted.
    ///
    /// An `Err` means the delivery could not be settled; it stays in flight
    /// until the queue redelivers it.
    pub async fn handle(&self, delivery: Delivery) -> Result<DispatchOutcome> {
        let started = Instant::now();
        let queue = self.config.in_queue.as_str();

        let mut item: WorkItem<P, M> = match delivery.decode() {
            Ok(item) => item,
            Err(e) => {
                warn!(msg_id = delivery.msg_id, error = %e, "undecodable work item, dropping");
                self.queue.ack(queue, delivery.msg_id).await?;
                return Ok(self.record(DispatchOutcome::Poison, started));
            }
        };

        // The body on the queue still says unregistered; a redelivery of it
        // registers again.
        let registers_here = !item.is_registered;
        let span = start_dispatch_span(&item.job_id, queue);
        let settled: Result<DispatchOutcome> = async {
            let mut states = Transitions {
                span: &span,
                state: "received",
            };
            record_state_transition(&span, "none", "received");
            if delivery.is_redelivery() {
                debug!(read_count = delivery.read_count, "redelivered work item");
            }

            match self.process(&mut item, &mut states).await {
                Ok(outcome) => {
                    self.queue.ack(queue, delivery.msg_id).await?;
                    Ok(outcome)
                }
                Err(Failure {
                    registered: false,
                    error,
                }) => {
                    warn!(error = %error, "work item failed before registration, returning to queue");
                    self.queue.nack(queue, delivery.msg_id).await?;
                    Ok(DispatchOutcome::Retry)
                }
                Err(Failure {
                    registered: true,
                    error,
                }) => {
                    states.to("faulted");
                    error!(error = %error, "work item faulted");
                    let fault = FaultMessage::new(item.clone(), error.to_string());
                    if let Err(e) = publish_message(
                        self.queue.as_ref(),
                        &self.config.fault_queue,
                        &fault,
                        ROOT_PRIORITY,
                    )
                    .await
                    {
                        if registers_here {
                            self.undo_registration(&item.job_id).await;
                        }
                        return Err(e);
                    }
                    self.queue.ack(queue, delivery.msg_id).await?;
                    Ok(DispatchOutcome::Faulted)
                }
            }
        }
        .instrument(span.clone())
        .await;

        Ok(self.record(settled?, started))
    }

    async fn process(
        &self,
        item: &mut WorkItem<P, M>,
        states: &mut Transitions<'_>,
    ) -> std::result::Result<DispatchOutcome, Failure> {
        if !item.is_registered {
            let pending = self
                .counter
                .register(&item.job_id)
                .await
                .map_err(Failure::unregistered)?;
            item.is_registered = true;
            debug!(pending, "registered submitted item");
        }
        states.to("registered");

        let item: &WorkItem<P, M> = item;
        let mut children = Vec::new();
        for worker in self.workers.iter().filter(|w| w.accepts(item)) {
            let produced = worker
                .process(item)
                .await
                .map_err(|e| Failure::registered(processing_error(worker.name(), e)))?;
            debug!(
                worker = worker.name(),
                children = produced.len(),
                "worker produced children"
            );
            children.extend(produced);
        }
        states.to("dispatched");

        let count = children.len();
        for child in children {
            self.publish_child(child)
                .await
                .map_err(Failure::registered)?;
        }
        states.to("children_published");

        let pending = self
            .counter
            .complete(&item.job_id)
            .await
            .map_err(Failure::registered)?;
        let finalized = pending == 0
            && finalize_if_finished(self.counter.as_ref(), &item.job_id, "dispatch").await;
        states.to("finalized");

        Ok(DispatchOutcome::Completed {
            children: count,
            finalized,
        })
    }

    /// Store the child's side effects, then register and publish it.
    async fn publish_child(&self, child: WorkItem<P, M>) -> Result<()> {
        self.store_side_effects(&child).await;

        self.counter.register(&child.job_id).await?;
        let child = child.registered();
        if let Err(e) = publish_message(
            self.queue.as_ref(),
            &self.config.in_queue,
            &child,
            CHILD_PRIORITY,
        )
        .await
        {
            // The registration would otherwise never be completed.
            self.undo_registration(&child.job_id).await;
            return Err(e);
        }

        metrics::children_published().add(1, &[]);
        Ok(())
    }

    async fn undo_registration(&self, job_id: &str) {
        if let Err(e) = self.counter.complete(job_id).await {
            error!(job_id, error = %e, "could not undo registration");
        }
    }

    /// Best-effort document and blob writes for a produced child. Failures
    /// are logged and counted; they never hold up the job's counter.
    async fn store_side_effects(&self, child: &WorkItem<P, M>) {
        let document = match (
            serde_json::to_value(&child.payload),
            serde_json::to_value(&child.metadata),
        ) {
            (Ok(data), Ok(metadata)) => Document::new(&child.job_id, data, metadata),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "could not serialize child for storage");
                store_failure("document");
                return;
            }
        };

        if let Err(e) = self.documents.add_document(&document).await {
            warn!(
                document_id = %document.document_id,
                store = self.documents.backend(),
                error = %e,
                "document write failed"
            );
            store_failure("document");
        }

        let bytes = match serde_json::to_vec(&document.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not serialize child payload");
                store_failure("blob");
                return;
            }
        };
        let blobs = Arc::clone(&self.blobs);
        let area = self.config.blob_area.clone();
        let path = format!("{}/{}.json", child.job_id, document.document_id);
        let stored = tokio::task::spawn_blocking(move || {
            blobs.store_file(&area, &path, &mut bytes.as_slice())
        })
        .await
        .map_err(|e| Error::Other(format!("blob write task failed: {e}")))
        .and_then(|result| result);

        match stored {
            Ok(info) => debug!(path = %info.path, size = info.size, md5 = %info.md5, "stored child payload"),
            Err(e) => {
                warn!(store = self.blobs.backend(), error = %e, "blob write failed");
                store_failure("blob");
            }
        }
    }

    fn record(&self, outcome: DispatchOutcome, started: Instant) -> DispatchOutcome {
        let labels = [KeyValue::new("outcome", outcome.label())];
        metrics::work_dispatched().add(1, &labels);
        metrics::dispatch_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);
        outcome
    }
}

fn processing_error(worker: &str, error: Error) -> Error {
    match error {
        Error::Processing { .. } => error,
        other => Error::Processing {
            worker: worker.to_string(),
            message: other.to_string(),
        },
    }
}

fn store_failure(store: &'static str) {
    metrics::store_failures().add(1, &[KeyValue::new("store", store)]);
}
