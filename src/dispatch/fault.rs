//! Fault queue consumer.
//!
//! Completes faulted items against their job so a branch that can never be
//! processed does not hold the job open forever. The failed branch is
//! dropped: the job still reports finished once it drains.

use opentelemetry::KeyValue;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{DispatchConfig, finalize_if_finished};
use crate::error::Result;
use crate::job::JobCounter;
use crate::model::{FaultMessage, WorkData, WorkItem};
use crate::queue::{Delivery, WorkQueue};
use crate::telemetry::metrics;

pub struct FaultHandler<P, M> {
    counter: Arc<dyn JobCounter>,
    queue: Arc<dyn WorkQueue>,
    fault_queue: String,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
    _items: PhantomData<fn() -> WorkItem<P, M>>,
}

impl<P, M> Clone for FaultHandler<P, M> {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            queue: Arc::clone(&self.queue),
            fault_queue: self.fault_queue.clone(),
            poll_interval: self.poll_interval,
            shutdown: Arc::clone(&self.shutdown),
            _items: PhantomData,
        }
    }
}

impl<P: WorkData, M: WorkData> FaultHandler<P, M> {
    pub fn new(
        counter: Arc<dyn JobCounter>,
        queue: Arc<dyn WorkQueue>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            counter,
            queue,
            fault_queue: config.fault_queue.clone(),
            poll_interval: config.poll_interval,
            shutdown: Arc::new(Notify::new()),
            _items: PhantomData,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Complete a faulted, already registered item and finalize its job if
    /// that drained it. Returns whether the job record was removed here.
    ///
    /// A job that no longer has a record was finalized by a racing
    /// completion; there is nothing left to compensate.
    pub async fn on_fault(&self, item: &WorkItem<P, M>) -> Result<bool> {
        metrics::work_faulted().add(1, &[KeyValue::new("backend", self.counter.backend())]);

        match self.counter.complete(&item.job_id).await {
            Ok(pending) => debug!(job_id = %item.job_id, pending, "compensated faulted item"),
            Err(e) if e.is_job_not_found() => {
                info!(job_id = %item.job_id, "job already finalized, nothing to compensate");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        Ok(finalize_if_finished(self.counter.as_ref(), &item.job_id, "fault").await)
    }

    /// Handle one fault delivery: ack once compensated, nack to retry when
    /// the counter could not be reached.
    pub async fn handle(&self, delivery: Delivery) -> Result<()> {
        let fault: FaultMessage<P, M> = match delivery.decode() {
            Ok(fault) => fault,
            Err(e) => {
                warn!(msg_id = delivery.msg_id, error = %e, "undecodable fault message, dropping");
                return self.queue.ack(&self.fault_queue, delivery.msg_id).await;
            }
        };

        if !fault.message.is_registered {
            warn!(job_id = %fault.message.job_id, "fault for an uncounted item, dropping");
            return self.queue.ack(&self.fault_queue, delivery.msg_id).await;
        }

        warn!(
            job_id = %fault.message.job_id,
            error = %fault.error,
            faulted_at = %fault.faulted_at,
            "handling faulted work item"
        );
        match self.on_fault(&fault.message).await {
            Ok(_) => self.queue.ack(&self.fault_queue, delivery.msg_id).await,
            Err(e) => {
                error!(job_id = %fault.message.job_id, error = %e, "fault compensation failed, will retry");
                self.queue.nack(&self.fault_queue, delivery.msg_id).await
            }
        }
    }

    /// Receive and handle one fault. Returns whether there was one.
    pub async fn process_next(&self) -> Result<bool> {
        match self.queue.receive(&self.fault_queue).await? {
            Some(delivery) => {
                self.handle(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut handled = 0;
        while self.process_next().await? {
            handled += 1;
        }
        Ok(handled)
    }

    /// Consume the fault queue until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.queue.ensure_queue(&self.fault_queue).await?;
        info!(queue = %self.fault_queue, "fault handler started");

        loop {
            let handled = tokio::select! {
                _ = self.shutdown.notified() => break,
                handled = self.process_next() => handled,
            };
            match handled {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "fault handling failed, backing off"),
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("fault handler shutting down");
        Ok(())
    }
}
