//! End-to-end dispatch over the in-process backends.

use async_trait::async_trait;
use jobtree::dispatch::{DispatchConfig, DispatchOutcome, FaultHandler, WorkDispatcher};
use jobtree::error::{Error, Result};
use jobtree::job::{JobCounter, LocalJobCounter};
use jobtree::model::{Document, Metadata, NodePayload, TreeNode, TreeWorkItem};
use jobtree::producer::Producer;
use jobtree::queue::{Delivery, MemoryQueue, QueueDepth, WorkQueue, publish_message};
use jobtree::store::{BlobStore, DocumentStore, MemoryBlobStore, MemoryDocumentStore};
use jobtree::worker::{NodeWorker, WorkerUnit};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Dispatcher = WorkDispatcher<NodePayload, Metadata>;
type Units = Vec<Arc<dyn WorkerUnit<NodePayload, Metadata>>>;

/// Counter wrapper that counts calls and can fail the first registrations.
#[derive(Default)]
struct CountingCounter {
    inner: LocalJobCounter,
    registers: AtomicUsize,
    completes: AtomicUsize,
    fail_registers: AtomicUsize,
}

#[async_trait]
impl JobCounter for CountingCounter {
    fn backend(&self) -> &'static str {
        "counting"
    }

    async fn register(&self, job_id: &str) -> Result<i64> {
        let remaining = self.fail_registers.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_registers.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Other("counter unavailable".into()));
        }
        self.registers.fetch_add(1, Ordering::SeqCst);
        self.inner.register(job_id).await
    }

    async fn complete(&self, job_id: &str) -> Result<i64> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        self.inner.complete(job_id).await
    }

    async fn is_finished(&self, job_id: &str) -> Result<bool> {
        self.inner.is_finished(job_id).await
    }

    async fn finalize(&self, job_id: &str) -> Result<bool> {
        self.inner.finalize(job_id).await
    }

    async fn pending(&self, job_id: &str) -> Result<Option<i64>> {
        self.inner.pending(job_id).await
    }
}

/// Fails on one node value, after nothing has been published for it.
struct FailOn(&'static str);

#[async_trait]
impl WorkerUnit<NodePayload, Metadata> for FailOn {
    fn name(&self) -> &str {
        "FailOn"
    }

    fn accepts(&self, item: &TreeWorkItem) -> bool {
        item.payload.root.as_ref().is_some_and(|n| n.value == self.0)
    }

    async fn process(&self, _item: &TreeWorkItem) -> Result<Vec<TreeWorkItem>> {
        Err(Error::Other(format!("cannot process {}", self.0)))
    }
}

struct FailingDocuments;

#[async_trait]
impl DocumentStore for FailingDocuments {
    fn backend(&self) -> &'static str {
        "failing"
    }

    fn default_collection(&self) -> &str {
        "documents"
    }

    async fn add_document_to(&self, _collection: &str, _document: &Document) -> Result<()> {
        Err(Error::Other("document store down".into()))
    }

    async fn retrieve_document_from(&self, _: &str, _: &str) -> Result<Option<Document>> {
        Ok(None)
    }
}

/// Queue wrapper recording the job's pending count at each publish.
struct ObservingQueue {
    inner: MemoryQueue,
    counter: Arc<LocalJobCounter>,
    seen: Mutex<Vec<(bool, Option<i64>)>>,
}

#[async_trait]
impl WorkQueue for ObservingQueue {
    fn backend(&self) -> &'static str {
        "observing"
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.inner.ensure_queue(queue).await
    }

    async fn publish(&self, queue: &str, body: serde_json::Value, priority: u8) -> Result<i64> {
        let item: TreeWorkItem = serde_json::from_value(body.clone())?;
        let pending = self.counter.pending(&item.job_id).await?;
        self.seen.lock().unwrap().push((item.is_registered, pending));
        self.inner.publish(queue, body, priority).await
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        self.inner.receive(queue).await
    }

    async fn ack(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.inner.ack(queue, msg_id).await
    }

    async fn nack(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.inner.nack(queue, msg_id).await
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        self.inner.depth(queue).await
    }
}

/// Queue wrapper whose first publish to the fault queue fails.
struct FlakyFaultQueue {
    inner: MemoryQueue,
    failures: AtomicUsize,
}

#[async_trait]
impl WorkQueue for FlakyFaultQueue {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.inner.ensure_queue(queue).await
    }

    async fn publish(&self, queue: &str, body: serde_json::Value, priority: u8) -> Result<i64> {
        if queue == "work_item_fault" && self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Other("fault queue unavailable".into()));
        }
        self.inner.publish(queue, body, priority).await
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        self.inner.receive(queue).await
    }

    async fn ack(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.inner.ack(queue, msg_id).await
    }

    async fn nack(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.inner.nack(queue, msg_id).await
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        self.inner.depth(queue).await
    }
}

/// Queue that cannot be reached at all.
struct DownQueue;

#[async_trait]
impl WorkQueue for DownQueue {
    fn backend(&self) -> &'static str {
        "down"
    }

    async fn ensure_queue(&self, _queue: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, _: &str, _: serde_json::Value, _: u8) -> Result<i64> {
        Err(Error::Other("queue unreachable".into()))
    }

    async fn receive(&self, _queue: &str) -> Result<Option<Delivery>> {
        Err(Error::Other("queue unreachable".into()))
    }

    async fn ack(&self, _: &str, _: i64) -> Result<()> {
        Err(Error::Other("queue unreachable".into()))
    }

    async fn nack(&self, _: &str, _: i64) -> Result<()> {
        Err(Error::Other("queue unreachable".into()))
    }

    async fn depth(&self, _queue: &str) -> Result<QueueDepth> {
        Err(Error::Other("queue unreachable".into()))
    }
}

fn node_units() -> Units {
    vec![Arc::new(NodeWorker)]
}

fn config() -> DispatchConfig {
    DispatchConfig {
        poll_interval: Duration::from_millis(10),
        ..DispatchConfig::default()
    }
}

async fn submit(queue: Arc<dyn WorkQueue>, job_id: &str, root: TreeNode) {
    Producer::new(queue, "work_item")
        .submit_tree(Some(job_id.to_string()), root, Metadata::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn seven_node_tree_registers_and_completes_every_node() {
    let counter = Arc::new(CountingCounter::default());
    let queue = Arc::new(MemoryQueue::default());
    let documents = Arc::new(MemoryDocumentStore::default());
    let blobs = Arc::new(MemoryBlobStore::new());
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config())
        .with_documents(documents.clone())
        .with_blobs(blobs.clone());

    submit(queue.clone(), "job-7", TreeNode::balanced(3, 2)).await;
    assert_eq!(dispatcher.run_until_idle().await.unwrap(), 7);

    assert_eq!(counter.registers.load(Ordering::SeqCst), 7);
    assert_eq!(counter.completes.load(Ordering::SeqCst), 7);
    assert!(counter.is_finished("job-7").await.unwrap());
    assert_eq!(counter.pending("job-7").await.unwrap(), None);
    assert!(queue.depth("work_item").await.unwrap().is_empty());

    // One document and one blob per produced child.
    assert_eq!(documents.documents_for_job("documents", "job-7").len(), 6);
    assert_eq!(blobs.len(), 6);
}

#[tokio::test]
async fn leaves_complete_without_children() {
    let counter = Arc::new(LocalJobCounter::new());
    let queue = Arc::new(MemoryQueue::default());
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config());

    submit(queue.clone(), "leaf", TreeNode::new("only")).await;
    let outcome = dispatcher.process_next().await.unwrap();
    assert_eq!(
        outcome,
        Some(DispatchOutcome::Completed {
            children: 0,
            finalized: true
        })
    );
    assert!(counter.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_drains_every_job() {
    let counter = Arc::new(LocalJobCounter::new());
    let queue = Arc::new(MemoryQueue::default());
    let dispatcher = Dispatcher::new(
        counter.clone(),
        queue.clone(),
        node_units(),
        DispatchConfig {
            max_concurrent: 16,
            ..config()
        },
    );

    let jobs = ["a", "b", "c"];
    for job in jobs {
        // 1 + 3 + 9 + 27 nodes
        submit(queue.clone(), job, TreeNode::balanced(4, 3)).await;
    }

    let runner = dispatcher.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while !queue.depth("work_item").await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue did not drain");

    dispatcher.shutdown();
    handle.await.unwrap().unwrap();

    for job in jobs {
        assert!(counter.is_finished(job).await.unwrap());
        assert_eq!(counter.pending(job).await.unwrap(), None);
    }
    assert!(counter.is_empty());
}

#[tokio::test]
async fn children_are_registered_before_they_are_published() {
    let counter = Arc::new(LocalJobCounter::new());
    let queue = Arc::new(ObservingQueue {
        inner: MemoryQueue::default(),
        counter: counter.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config());

    submit(queue.clone(), "job", TreeNode::balanced(3, 2)).await;
    dispatcher.run_until_idle().await.unwrap();

    let seen = queue.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 7);
    // The root is published before anything is counted.
    assert_eq!(seen[0], (false, None));
    // Every child is already counted, and its parent is still outstanding.
    for (registered, pending) in &seen[1..] {
        assert!(*registered);
        assert!(pending.unwrap() >= 2, "pending {pending:?}");
    }
}

#[tokio::test]
async fn faulted_branch_is_compensated_and_job_finishes() {
    let counter = Arc::new(CountingCounter::default());
    let queue = Arc::new(MemoryQueue::default());
    let units: Units = vec![Arc::new(NodeWorker), Arc::new(FailOn("0.1"))];
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), units, config());
    let faults = FaultHandler::<NodePayload, Metadata>::new(counter.clone(), queue.clone(), &config());

    submit(queue.clone(), "job", TreeNode::balanced(3, 2)).await;

    let mut outcomes = Vec::new();
    while let Some(outcome) = dispatcher.process_next().await.unwrap() {
        outcomes.push(outcome);
    }
    assert_eq!(
        outcomes.iter().filter(|o| **o == DispatchOutcome::Faulted).count(),
        1
    );
    // 0.1's children were never published: root, 0.0, 0.1, 0.0.0, 0.0.1.
    assert_eq!(outcomes.len(), 5);
    assert_eq!(counter.pending("job").await.unwrap(), Some(1));

    assert_eq!(faults.run_until_idle().await.unwrap(), 1);
    assert_eq!(counter.registers.load(Ordering::SeqCst), 5);
    assert_eq!(counter.completes.load(Ordering::SeqCst), 5);
    assert!(counter.is_finished("job").await.unwrap());
    assert_eq!(counter.pending("job").await.unwrap(), None);
}

#[tokio::test]
async fn failed_registration_returns_item_to_queue() {
    let counter = Arc::new(CountingCounter::default());
    counter.fail_registers.store(1, Ordering::SeqCst);
    let queue = Arc::new(MemoryQueue::default());
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config());

    submit(queue.clone(), "job", TreeNode::new("0")).await;

    assert_eq!(
        dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Retry)
    );
    assert_eq!(
        dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Completed {
            children: 0,
            finalized: true
        })
    );
    assert!(queue.depth("work_item_fault").await.unwrap().is_empty());
}

#[tokio::test]
async fn completing_a_finalized_job_faults_then_is_tolerated() {
    let counter = Arc::new(LocalJobCounter::new());
    let queue = Arc::new(MemoryQueue::default());
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config());
    let faults = FaultHandler::<NodePayload, Metadata>::new(counter.clone(), queue.clone(), &config());

    // A stale, already counted item whose job record is gone.
    let stale = TreeWorkItem::root("gone", NodePayload::new(TreeNode::new("0")), Metadata::default())
        .registered();
    publish_message(queue.as_ref(), "work_item", &stale, 2)
        .await
        .unwrap();

    assert_eq!(
        dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Faulted)
    );
    assert_eq!(faults.run_until_idle().await.unwrap(), 1);
    assert!(counter.is_empty());
    assert!(queue.depth("work_item_fault").await.unwrap().is_empty());
}

#[tokio::test]
async fn undecodable_message_is_dropped() {
    let counter = Arc::new(LocalJobCounter::new());
    let queue = Arc::new(MemoryQueue::default());
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config());

    queue
        .publish("work_item", serde_json::json!(42), 1)
        .await
        .unwrap();
    assert_eq!(
        dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Poison)
    );
    assert!(queue.depth("work_item").await.unwrap().is_empty());
}

#[tokio::test]
async fn store_failures_do_not_block_completion() {
    let counter = Arc::new(LocalJobCounter::new());
    let queue = Arc::new(MemoryQueue::default());
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config())
        .with_documents(Arc::new(FailingDocuments))
        .with_blobs(blobs);

    submit(queue.clone(), "job", TreeNode::balanced(3, 2)).await;
    assert_eq!(dispatcher.run_until_idle().await.unwrap(), 7);
    assert!(counter.is_finished("job").await.unwrap());
    assert!(counter.is_empty());
}

#[tokio::test]
async fn missing_fields_deserialize_as_defaults() {
    let counter = Arc::new(LocalJobCounter::new());
    let queue = Arc::new(MemoryQueue::default());
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), node_units(), config());

    queue
        .publish(
            "work_item",
            serde_json::json!({
                "job_id": "sparse",
                "payload": { "root": { "value": "0", "children": [{ "value": "0.0" }] } },
                "metadata": null
            }),
            1,
        )
        .await
        .unwrap();

    assert_eq!(dispatcher.run_until_idle().await.unwrap(), 2);
    assert!(counter.is_empty());
}

#[tokio::test]
async fn unroutable_fault_undoes_the_root_registration() {
    let counter = Arc::new(CountingCounter::default());
    let queue = Arc::new(FlakyFaultQueue {
        inner: MemoryQueue::new(Duration::from_millis(20)),
        failures: AtomicUsize::new(0),
    });
    let units: Units = vec![Arc::new(FailOn("root"))];
    let dispatcher = Dispatcher::new(counter.clone(), queue.clone(), units, config());
    let faults = FaultHandler::<NodePayload, Metadata>::new(counter.clone(), queue.clone(), &config());

    submit(queue.clone(), "job", TreeNode::new("root")).await;

    // Fault queue down: the delivery stays in flight and its count is undone.
    let err = dispatcher.process_next().await.unwrap_err();
    assert!(err.to_string().contains("fault queue unavailable"), "{err}");
    assert_eq!(counter.pending("job").await.unwrap(), Some(0));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Faulted)
    );
    assert_eq!(faults.run_until_idle().await.unwrap(), 1);

    assert_eq!(counter.registers.load(Ordering::SeqCst), 2);
    assert_eq!(counter.completes.load(Ordering::SeqCst), 2);
    assert!(counter.is_finished("job").await.unwrap());
    assert_eq!(counter.pending("job").await.unwrap(), None);
    assert!(queue.depth("work_item").await.unwrap().is_empty());
    assert!(queue.depth("work_item_fault").await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_interrupts_receive_back_off() {
    let dispatcher = Dispatcher::new(
        Arc::new(LocalJobCounter::new()),
        Arc::new(DownQueue),
        node_units(),
        DispatchConfig {
            poll_interval: Duration::from_secs(60),
            ..DispatchConfig::default()
        },
    );

    let running = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    dispatcher.shutdown();

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("dispatcher kept backing off after shutdown")
        .unwrap()
        .unwrap();
}
