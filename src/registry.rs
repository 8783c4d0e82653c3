//! Service wiring.
//!
//! [`ServiceRegistry`] maps `"<service_name>.<service_type>"` keys to
//! factories. Building walks the services file in declaration order; each
//! factory reads its typed options and whatever earlier services it depends
//! on from a [`ServiceContext`], and leaves its product there.

use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{ServiceDefinition, ServicesConfig, secret_var};
use crate::db::Db;
use crate::dispatch::{
    DEFAULT_FAULT_QUEUE, DEFAULT_IN_QUEUE, DispatchConfig, FaultHandler, WorkDispatcher,
};
use crate::error::{Error, Result};
use crate::job::{JobCounter, JobManager, LocalJobCounter, PgJobCounter};
use crate::model::{Metadata, NodePayload};
use crate::producer::Producer;
use crate::queue::{MemoryQueue, PgmqQueue, WorkQueue};
use crate::store::blob::DEFAULT_AREA;
use crate::store::document::DEFAULT_COLLECTION;
use crate::store::{
    BlobStore, DocumentStore, LocalBlobStore, MemoryBlobStore, MemoryDocumentStore,
    PgDocumentStore,
};
use crate::worker::{NodeWorker, WorkerRegistry, WorkerUnit};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseOptions {
    /// Environment variable holding the connection URL.
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            url_env: "DATABASE_URL".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueOptions {
    pub in_queue: String,
    pub fault_queue: String,
    /// Seconds a received message stays hidden before redelivery.
    pub visibility_timeout: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            in_queue: DEFAULT_IN_QUEUE.to_string(),
            fault_queue: DEFAULT_FAULT_QUEUE.to_string(),
            visibility_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DocumentStoreOptions {
    pub collection: String,
}

impl Default for DocumentStoreOptions {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatastoreOptions {
    /// Filesystem root for `datastore.local`.
    pub root: Option<PathBuf>,
    /// Area child payloads are written to.
    pub area: String,
}

impl Default for DatastoreOptions {
    fn default() -> Self {
        Self {
            root: None,
            area: DEFAULT_AREA.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersOptions {
    /// Worker units in dispatch order.
    pub names: Vec<String>,
}

impl Default for WorkersOptions {
    fn default() -> Self {
        Self {
            names: vec![NodeWorker::NAME.to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Products of the factories run so far.
#[derive(Default)]
pub struct ServiceContext {
    pub db: Option<Arc<Db>>,
    pub counter: Option<Arc<dyn JobCounter>>,
    pub queue: Option<(Arc<dyn WorkQueue>, QueueOptions)>,
    pub documents: Option<Arc<dyn DocumentStore>>,
    pub blobs: Option<(Arc<dyn BlobStore>, String)>,
    pub worker_names: Option<Vec<String>>,
}

impl ServiceContext {
    /// The database, which `service` must list in `depends_on`.
    fn database(&self, service: &ServiceDefinition) -> Result<Arc<Db>> {
        if !service.depends_on("database") {
            return Err(Error::Config(format!(
                "{} must declare depends_on = [\"database\"]",
                service.key()
            )));
        }
        self.db
            .clone()
            .ok_or_else(|| Error::Config(format!("{} requires a database service", service.key())))
    }
}

pub type ServiceFactory = fn(&ServiceDefinition, &mut ServiceContext) -> Result<()>;

pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("database.postgres", build_database)
            .register("job_manager.local", build_local_job_manager)
            .register("job_manager.postgres", build_pg_job_manager)
            .register("queue.memory", build_memory_queue)
            .register("queue.pgmq", build_pgmq_queue)
            .register("document_store.local", build_local_document_store)
            .register("document_store.postgres", build_pg_document_store)
            .register("datastore.local", build_local_datastore)
            .register("datastore.memory", build_memory_datastore)
            .register("workers.default", build_workers);
        registry
    }

    pub fn register(&mut self, key: &str, factory: ServiceFactory) -> &mut Self {
        self.factories.insert(key.to_lowercase(), factory);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(&key.to_lowercase())
    }

    /// Validate a services file against this registry without building
    /// anything: ordering, known keys, options and worker names.
    pub fn check(
        &self,
        config: &ServicesConfig,
        workers: &WorkerRegistry<NodePayload, Metadata>,
    ) -> Result<()> {
        config.validate()?;
        for service in &config.services {
            if !self.contains(&service.key()) {
                return Err(Error::Config(format!("unknown service {}", service.key())));
            }
            match service.service_name.to_lowercase().as_str() {
                "database" => {
                    service.options::<DatabaseOptions>()?;
                }
                "queue" => {
                    service.options::<QueueOptions>()?;
                }
                "document_store" => {
                    service.options::<DocumentStoreOptions>()?;
                }
                "datastore" => {
                    service.options::<DatastoreOptions>()?;
                }
                "workers" => {
                    let options: WorkersOptions = service.options()?;
                    if let Some(name) = options.names.iter().find(|n| !workers.contains(n)) {
                        return Err(Error::Config(format!("unknown worker: {name}")));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Run every factory in declaration order and assemble the result.
    pub fn build(
        &self,
        config: &ServicesConfig,
        workers: &WorkerRegistry<NodePayload, Metadata>,
    ) -> Result<Services> {
        self.check(config, workers)?;

        let mut ctx = ServiceContext::default();
        for service in &config.services {
            let key = service.key();
            let factory = self
                .factories
                .get(&key)
                .ok_or_else(|| Error::Config(format!("unknown service {key}")))?;
            factory(service, &mut ctx)?;
            info!(service = %key, "service configured");
        }

        let counter = ctx
            .counter
            .ok_or_else(|| Error::Config("no job_manager service configured".to_string()))?;
        let (queue, queue_options) = ctx
            .queue
            .ok_or_else(|| Error::Config("no queue service configured".to_string()))?;
        let documents: Arc<dyn DocumentStore> = match ctx.documents {
            Some(documents) => documents,
            None => Arc::new(MemoryDocumentStore::default()),
        };
        let (blobs, blob_area): (Arc<dyn BlobStore>, String) = match ctx.blobs {
            Some(blobs) => blobs,
            None => (Arc::new(MemoryBlobStore::new()), DEFAULT_AREA.to_string()),
        };
        let names = ctx
            .worker_names
            .unwrap_or_else(|| WorkersOptions::default().names);

        Ok(Services {
            db: ctx.db,
            jobs: JobManager::new(counter),
            queue,
            queue_options,
            documents,
            blobs,
            blob_area,
            workers: workers.build(&names)?,
        })
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn build_database(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: DatabaseOptions = service.options()?;
    let url = secret_var(&options.url_env)?;
    let db = Db::connect_lazy(url.expose_secret(), options.max_connections)
        .map_err(|e| Error::Config(format!("invalid database url in {}: {e}", options.url_env)))?;
    ctx.db = Some(Arc::new(db));
    Ok(())
}

fn build_local_job_manager(_: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    ctx.counter = Some(Arc::new(LocalJobCounter::new()));
    Ok(())
}

fn build_pg_job_manager(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let db = ctx.database(service)?;
    ctx.counter = Some(Arc::new(PgJobCounter::new(db)));
    Ok(())
}

fn build_memory_queue(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: QueueOptions = service.options()?;
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new(Duration::from_secs(u64::from(
        options.visibility_timeout,
    ))));
    ctx.queue = Some((queue, options));
    Ok(())
}

fn build_pgmq_queue(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: QueueOptions = service.options()?;
    let db = ctx.database(service)?;
    let visibility = i32::try_from(options.visibility_timeout)
        .map_err(|_| Error::Config("visibility_timeout is too large".to_string()))?;
    let queue: Arc<dyn WorkQueue> = Arc::new(PgmqQueue::new(db, visibility));
    ctx.queue = Some((queue, options));
    Ok(())
}

fn build_local_document_store(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: DocumentStoreOptions = service.options()?;
    ctx.documents = Some(Arc::new(MemoryDocumentStore::new(options.collection)));
    Ok(())
}

fn build_pg_document_store(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: DocumentStoreOptions = service.options()?;
    let db = ctx.database(service)?;
    ctx.documents = Some(Arc::new(PgDocumentStore::new(db, options.collection)));
    Ok(())
}

fn build_local_datastore(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: DatastoreOptions = service.options()?;
    let root = options
        .root
        .ok_or_else(|| Error::Config(format!("{} requires a root path", service.key())))?;
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(root));
    ctx.blobs = Some((blobs, options.area));
    Ok(())
}

fn build_memory_datastore(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: DatastoreOptions = service.options()?;
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    ctx.blobs = Some((blobs, options.area));
    Ok(())
}

fn build_workers(service: &ServiceDefinition, ctx: &mut ServiceContext) -> Result<()> {
    let options: WorkersOptions = service.options()?;
    ctx.worker_names = Some(options.names);
    Ok(())
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Fully wired backends, ready to hand to consumers.
pub struct Services {
    pub db: Option<Arc<Db>>,
    pub jobs: JobManager,
    pub queue: Arc<dyn WorkQueue>,
    pub queue_options: QueueOptions,
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub blob_area: String,
    pub workers: Vec<Arc<dyn WorkerUnit<NodePayload, Metadata>>>,
}

impl Services {
    /// Run migrations (when a database is configured) and create queues.
    pub async fn prepare(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.migrate().await?;
        }
        self.queue.ensure_queue(&self.queue_options.in_queue).await?;
        self.queue
            .ensure_queue(&self.queue_options.fault_queue)
            .await?;
        Ok(())
    }

    pub fn dispatch_config(&self, max_concurrent: usize) -> DispatchConfig {
        DispatchConfig {
            in_queue: self.queue_options.in_queue.clone(),
            fault_queue: self.queue_options.fault_queue.clone(),
            blob_area: self.blob_area.clone(),
            max_concurrent,
            ..DispatchConfig::default()
        }
    }

    pub fn dispatcher(&self, max_concurrent: usize) -> WorkDispatcher<NodePayload, Metadata> {
        WorkDispatcher::new(
            Arc::clone(self.jobs.counter()),
            Arc::clone(&self.queue),
            self.workers.clone(),
            self.dispatch_config(max_concurrent),
        )
        .with_documents(Arc::clone(&self.documents))
        .with_blobs(Arc::clone(&self.blobs))
    }

    pub fn fault_handler(&self) -> FaultHandler<NodePayload, Metadata> {
        FaultHandler::new(
            Arc::clone(self.jobs.counter()),
            Arc::clone(&self.queue),
            &self.dispatch_config(1),
        )
    }

    pub fn producer(&self) -> Producer {
        Producer::new(Arc::clone(&self.queue), self.queue_options.in_queue.clone())
    }
}
