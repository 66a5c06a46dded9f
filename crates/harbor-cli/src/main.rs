//! Command-line driver for the Harbor offline worker.
//!
//! Installs a worker version into a cache store and routes requests through
//! it, printing one JSON document per result:
//! - `install`: precache a manifest and activate the worker
//! - `fetch`: install, then route URLs through the worker
//! - `caches`: list the caches of a store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use harbor_cache::{CacheStorage, SqliteBackend, SystemClock};
use harbor_common::{init_logging, HarborError, LogConfig, LogFormat, ResultExt};
use harbor_net::{LoaderConfig, Request, ResourceLoader};
use harbor_sw::{
    PrecacheManifest, Registration, ResponseSource, WorkerConfig, WorkerContext, WorkerInfo,
    WorkerScript,
};
use serde::Serialize;
use tracing::error;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(about = "Offline caching worker driver")]
struct Args {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    /// Log filter directives, overriding -v (e.g. "harbor_sw=debug")
    #[arg(long, global = true)]
    log_filter: Option<String>,

    /// SQLite cache store; caches are kept in memory when omitted
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Precache a manifest and activate the worker
    Install {
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Install, then route each URL through the worker
    Fetch {
        #[command(flatten)]
        worker: WorkerArgs,

        /// Treat the URLs as page navigations
        #[arg(long)]
        navigate: bool,

        /// URLs (or origin-relative paths) to request
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// List caches and their entry counts
    Caches,
}

#[derive(clap::Args, Debug)]
struct WorkerArgs {
    /// Worker configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Precache manifest (JSON array of {url, revision})
    #[arg(long)]
    manifest: PathBuf,

    /// Override the configured origin
    #[arg(long)]
    origin: Option<Url>,

    /// Override the configured version
    #[arg(long)]
    version: Option<String>,
}

#[derive(Serialize)]
struct InstallResult {
    worker: WorkerInfo,
    caches: Vec<String>,
}

#[derive(Serialize)]
struct FetchResult {
    url: String,
    status: Option<u16>,
    source: Option<ResponseSource>,
    bytes: Option<usize>,
    error: Option<String>,
}

#[derive(Serialize)]
struct CacheSummary {
    name: String,
    entries: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut logging = LogConfig::from_verbosity(args.verbose).with_format(args.log_format);
    if let Some(ref filter) = args.log_filter {
        logging = logging.with_filter(filter.clone());
    }
    if let Err(e) = init_logging(logging) {
        eprintln!("harbor: {e}");
    }

    if let Err(e) = run(args).await {
        error!(category = e.category(), "{e}");
        eprintln!("harbor: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> harbor_common::Result<()> {
    let storage = Arc::new(open_storage(args.db.as_deref())?);

    match args.command {
        Command::Install { worker } => {
            let registration = install(&worker, Arc::clone(&storage)).await?;
            let worker = registration
                .active()
                .await
                .ok_or_else(|| HarborError::lifecycle("worker did not activate"))?;
            print_json(&InstallResult {
                worker,
                caches: storage.keys().await?,
            })
        }
        Command::Fetch {
            worker,
            navigate,
            urls,
        } => {
            let registration = install(&worker, Arc::clone(&storage)).await?;
            let client = registration.connect_client(registration.scope().clone()).await;

            for raw in urls {
                let url = registration
                    .scope()
                    .join(&raw)
                    .map_err(|e| HarborError::config(format!("invalid url '{raw}': {e}")))?;
                let request = if navigate {
                    Request::navigate(url.clone())
                } else {
                    Request::get(url.clone())
                };

                let result = match registration.fetch(client.id, request).await {
                    Ok(response) => {
                        if let Some(revalidation) = response.revalidation {
                            revalidation.await.context("background revalidation")?;
                        }
                        FetchResult {
                            url: url.to_string(),
                            status: Some(response.response.status),
                            source: Some(response.source),
                            bytes: Some(response.response.body.len()),
                            error: None,
                        }
                    }
                    Err(e) => FetchResult {
                        url: url.to_string(),
                        status: None,
                        source: None,
                        bytes: None,
                        error: Some(e.to_string()),
                    },
                };
                print_json(&result)?;
            }
            Ok(())
        }
        Command::Caches => {
            for name in storage.keys().await? {
                let cache = storage.open(&name).await?;
                let entries = cache.len().await?;
                print_json(&CacheSummary { name, entries })?;
            }
            Ok(())
        }
    }
}

fn open_storage(db: Option<&Path>) -> harbor_common::Result<CacheStorage> {
    match db {
        Some(path) => {
            let backend = SqliteBackend::open(path)?;
            Ok(CacheStorage::new(Arc::new(backend), Arc::new(SystemClock)))
        }
        None => Ok(CacheStorage::in_memory()),
    }
}

fn load_script(args: &WorkerArgs) -> harbor_common::Result<WorkerScript> {
    let mut config = match args.config {
        Some(ref path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(ref origin) = args.origin {
        config.origin = origin.clone();
    }
    if let Some(ref version) = args.version {
        config.version = version.clone();
    }
    config.validate()?;

    let manifest = PrecacheManifest::from_file(&args.manifest)?;
    Ok(WorkerScript::new(config, manifest))
}

async fn install(args: &WorkerArgs, storage: Arc<CacheStorage>) -> harbor_common::Result<Registration> {
    let script = load_script(args)?;
    let loader = ResourceLoader::new(LoaderConfig::default())?;

    let registration = Registration::new(
        script.config.origin.clone(),
        WorkerContext::new(storage, Arc::new(loader)),
    );
    registration.update(script).await?;
    Ok(registration)
}

fn print_json<T: Serialize>(value: &T) -> harbor_common::Result<()> {
    let line = serde_json::to_string(value).context("encoding output")?;
    println!("{line}");
    Ok(())
}
