//! jobtree CLI: run consumers, submit jobs, inspect job state.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use jobtree::config::{Config, ServicesConfig};
use jobtree::model::{Metadata, TreeNode};
use jobtree::registry::{ServiceRegistry, Services};
use jobtree::telemetry::{TelemetryConfig, init_telemetry};
use jobtree::worker::WorkerRegistry;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "jobtree", about = "Fan-out/fan-in processing of tree-shaped jobs")]
struct Cli {
    /// Services file (overrides JOBTREE_SERVICES)
    #[arg(long, global = true)]
    services: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher and fault handler until Ctrl-C
    Serve {
        /// Deliveries processed concurrently
        #[arg(long, default_value_t = 8)]
        max_concurrent: usize,
    },
    /// Submit a JSON tree file as a new job
    Submit {
        /// File holding one tree node: {"value": "...", "children": [...]}
        tree: PathBuf,
        /// Job id to use instead of a generated one
        #[arg(long)]
        job_id: Option<String>,
        /// Bucket results are written to
        #[arg(long)]
        result_bucket: Option<String>,
        /// Key prefix results are written under
        #[arg(long)]
        result_prefix: Option<String>,
    },
    /// Show whether a job has finished
    Status {
        job_id: String,
    },
    /// Validate the services file and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let services_path = cli.services.unwrap_or_else(|| config.services_path.clone());

    match cli.command {
        Command::Serve { max_concurrent } => cmd_serve(&config, &services_path, max_concurrent).await,
        Command::Submit {
            tree,
            job_id,
            result_bucket,
            result_prefix,
        } => {
            let services = load_services(&services_path)?;
            services.prepare().await?;
            let metadata = Metadata {
                result_bucket,
                result_prefix,
                ..Metadata::default()
            };
            cmd_submit(&services, &tree, job_id, metadata).await
        }
        Command::Status { job_id } => {
            let services = load_services(&services_path)?;
            cmd_status(&services, &job_id).await
        }
        Command::Check => cmd_check(&services_path),
    }
}

fn load_services(path: &Path) -> anyhow::Result<Services> {
    let config = ServicesConfig::load(path)?;
    Ok(ServiceRegistry::with_defaults().build(&config, &WorkerRegistry::with_defaults())?)
}

async fn cmd_serve(config: &Config, services_path: &Path, max_concurrent: usize) -> anyhow::Result<()> {
    let services = load_services(services_path)?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        in_queue: Some(services.queue_options.in_queue.clone()),
        fault_queue: Some(services.queue_options.fault_queue.clone()),
        max_concurrent: Some(max_concurrent),
        ..TelemetryConfig::local("jobtree", config.log_level.clone())
    })?;

    services.prepare().await?;

    let dispatcher = services.dispatcher(max_concurrent);
    let faults = services.fault_handler();

    let (d, f) = (dispatcher.clone(), faults.clone());
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        d.shutdown();
        f.shutdown();
    });

    tokio::try_join!(dispatcher.run(), faults.run())?;
    Ok(())
}

async fn cmd_submit(
    services: &Services,
    tree: &Path,
    job_id: Option<String>,
    metadata: Metadata,
) -> anyhow::Result<()> {
    if services.queue.backend() == "memory" {
        eprintln!("warning: in-process queue configured; the job will not outlive this command");
    }

    let content = std::fs::read_to_string(tree)
        .with_context(|| format!("cannot read tree file {}", tree.display()))?;
    let root: TreeNode = serde_json::from_str(&content)
        .with_context(|| format!("bad tree file {}", tree.display()))?;
    let nodes = root.node_count();

    let job_id = services
        .producer()
        .submit_tree(job_id, root, metadata)
        .await?;
    println!("Submitted: {job_id} ({nodes} nodes)");
    Ok(())
}

async fn cmd_status(services: &Services, job_id: &str) -> anyhow::Result<()> {
    let pending = services.jobs.counter().pending(job_id).await?;
    let finished = services.jobs.is_job_finished(job_id).await?;

    println!("Job:       {job_id}");
    println!(
        "Pending:   {}",
        pending.map_or_else(|| "-".to_string(), |n| n.to_string())
    );
    println!("Finished:  {}", if finished { "yes" } else { "no" });
    Ok(())
}

fn cmd_check(services_path: &Path) -> anyhow::Result<()> {
    let config = ServicesConfig::load(services_path)?;
    ServiceRegistry::with_defaults().check(&config, &WorkerRegistry::with_defaults())?;

    println!("{}: ok", services_path.display());
    for service in &config.services {
        let depends = if service.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (depends on {})", service.depends_on.join(", "))
        };
        println!("  {}{depends}", service.key());
    }
    Ok(())
}
