use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use courier_config::{CourierConfig, CourierConfigSource};
use courier_core::jobs::{
    BacklogReport, JobAdmin, JobClient, JobId, JobRuntime, LifecycleEventBus, PostgresJobStore,
    QueueCatalog,
};
use courier_server::{app, handlers};
use tracing::{info, warn};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "courier-server")]
#[command(about = "Durable multi-queue job worker")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, global = true, env = "COURIER_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct ServeArgs {
    /// Identity recorded on claimed jobs (defaults to courier-<pid>)
    #[arg(long, env = "COURIER_WORKER_ID")]
    worker_id: Option<String>,

    /// Print every lifecycle event to stdout as a JSON line
    #[arg(long, default_value_t = false)]
    emit_events: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the dispatchers until interrupted (default)
    Serve(ServeArgs),
    /// Apply database migrations and exit
    Migrate,
    /// Enqueue one job
    Enqueue(EnqueueArgs),
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(ClapArgs, Debug)]
struct EnqueueArgs {
    /// Job type as declared in the catalog
    job_type: String,

    /// JSON object handed to the handler
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Run no earlier than this long from now (e.g. 30s, 5m, 1h)
    #[arg(long, value_parser = humantime::parse_duration)]
    delay: Option<Duration>,

    /// Run no earlier than this RFC 3339 timestamp
    #[arg(long, conflicts_with = "delay")]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    /// Job counts per queue and status
    Stats {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print one job record, including its attempt history
    Inspect { id: JobId },
    /// Copy a failed job into a new pending job
    Requeue { id: JobId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_loaded = dotenvy::dotenv().is_ok();
    let cli = Cli::parse();
    app::init_tracing();
    if env_loaded {
        info!("loaded .env file");
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        None => serve(config, cli.serve).await,
        Some(Command::Serve(args)) => serve(config, args).await,
        Some(Command::Migrate) => migrate(&config).await,
        Some(Command::Enqueue(args)) => enqueue(&config, args).await,
        Some(Command::Jobs(command)) => jobs(&config, command).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CourierConfig> {
    let cwd = env::current_dir().context("failed to resolve working directory")?;
    let explicit = path.map(|path| path.display().to_string());
    let (config, source) = CourierConfig::load_with(
        |key| match (key, &explicit) {
            ("COURIER_CONFIG_PATH", Some(path)) => Some(path.clone()),
            _ => env::var(key).ok(),
        },
        &cwd,
    )
    .context("failed to load configuration")?;

    match source {
        CourierConfigSource::Default => {
            warn!("no courier config found; using defaults with an empty catalog")
        }
        CourierConfigSource::EnvInline => info!("loaded config from COURIER_CONFIG_JSON"),
        CourierConfigSource::EnvPath(path) | CourierConfigSource::File(path) => {
            info!(path = %path.display(), "loaded config file")
        }
    }
    Ok(config)
}

async fn serve(config: CourierConfig, args: ServeArgs) -> anyhow::Result<()> {
    let catalog = config.validate()?;
    info!(
        queues = catalog.queues().count(),
        job_types = catalog.job_types().count(),
        global_capacity = ?catalog.global_capacity(),
        "catalog loaded"
    );

    app::install_metrics(config.telemetry.metrics_listen)?;
    let store = app::connect_store(&config).await?;
    let registry = handlers::build_registry(&config.handlers)?;

    let bus = Arc::new(LifecycleEventBus::new(config.telemetry.event_buffer));
    let mut runtime = JobRuntime::new(&config.dispatch, store, registry, app::telemetry(&bus))
        .context("failed to assemble job runtime")?;
    if let Some(worker_id) = args.worker_id {
        runtime = runtime.with_worker_id(worker_id);
    }

    let printer = args
        .emit_events
        .then(|| app::spawn_event_printer(&bus, runtime.shutdown_token()));

    runtime.start().await?;
    info!(worker_id = runtime.worker_id(), "worker running; press Ctrl-C to stop");

    let signal = app::shutdown_signal().await;
    runtime.shutdown().await?;
    if let Some(printer) = printer
        && let Err(err) = printer.await
    {
        warn!(error = %err, "event printer task failed");
    }
    signal
}

async fn migrate(config: &CourierConfig) -> anyhow::Result<()> {
    let pool = app::connect_pool(config).await?;
    PostgresJobStore::migrate(&pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied successfully");
    Ok(())
}

fn catalog(config: &CourierConfig) -> anyhow::Result<Arc<QueueCatalog>> {
    let catalog = QueueCatalog::from_config(&config.dispatch)
        .context("invalid dispatch configuration")?;
    Ok(Arc::new(catalog))
}

async fn enqueue(config: &CourierConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;
    let client = JobClient::new(app::connect_store(config).await?, catalog(config)?);

    let id = match (args.at, args.delay) {
        (Some(at), _) => client.enqueue(&args.job_type, payload, Some(at)).await?,
        (None, Some(delay)) => client.enqueue_in(&args.job_type, payload, delay).await?,
        (None, None) => client.enqueue(&args.job_type, payload, None).await?,
    };

    info!(job_id = %id, job_type = %args.job_type, "job enqueued");
    println!("{id}");
    Ok(())
}

async fn jobs(config: &CourierConfig, command: JobsCommand) -> anyhow::Result<()> {
    let admin = JobAdmin::new(app::connect_store(config).await?, catalog(config)?);

    match command {
        JobsCommand::Stats { json } => {
            let report = admin.backlog().await?;
            for queue in report.orphaned(admin.catalog()) {
                warn!(queue = %queue, "queue has stored jobs but is not in the catalog");
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_backlog(&report));
            }
        }
        JobsCommand::Inspect { id } => {
            let record = admin.inspect(id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        JobsCommand::Requeue { id } => {
            let new_id = admin.requeue(id).await?;
            println!("{new_id}");
        }
    }
    Ok(())
}

fn render_backlog(report: &BacklogReport) -> String {
    let width = report
        .queues
        .keys()
        .map(|name| name.as_str().len())
        .max()
        .unwrap_or(0)
        .max("QUEUE".len());

    let mut out = format!(
        "{:<width$}  {:>8}  {:>8}  {:>8}  {:>10}  {:>8}\n",
        "QUEUE", "PENDING", "RUNNING", "RETRYING", "COMPLETED", "FAILED"
    );
    for (name, backlog) in &report.queues {
        out.push_str(&format!(
            "{:<width$}  {:>8}  {:>8}  {:>8}  {:>10}  {:>8}\n",
            name.as_str(),
            backlog.pending,
            backlog.running,
            backlog.retrying,
            backlog.completed,
            backlog.failed
        ));
    }
    out
}
