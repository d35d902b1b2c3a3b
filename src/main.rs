use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing::{error, info};

use search_sync::checkpoint::{sync_name, BrokerStore, CheckpointStore, FileStore};
use search_sync::connect::{self, PgOpts};
use search_sync::engine::{parallel_sync, SyncEngine};
use search_sync::error::SyncError;
use search_sync::indexer::HttpIndexer;
use search_sync::install::Installer;
use search_sync::queue::{EventQueue, RedisQueue};
use search_sync::reflect::Reflection;
use search_sync::schema::{NodeConfig, SyncConfig};
use search_sync::settings::Settings;
use search_sync::tree::Tree;
use search_sync::{NotificationListener, ReplicationReader};

#[derive(Parser)]
#[command(name = "search-sync")]
#[command(about = "Sync PostgreSQL tables to an Elasticsearch/OpenSearch index")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install (or remove) the notification function, triggers, helper view
    /// and replication slot
    Bootstrap {
        /// Schema config file
        #[arg(long, short, env = "SCHEMA")]
        config: PathBuf,

        /// Remove the database artifacts instead of creating them
        #[arg(long)]
        teardown: bool,

        /// Only create objects that do not exist yet
        #[arg(long)]
        no_create: bool,

        #[command(flatten)]
        pg: PgArgs,
    },
    /// Run the sync engine once, or forever with --daemon
    Sync {
        /// Schema config file
        #[arg(long, short, env = "SCHEMA")]
        config: PathBuf,

        /// Keep running: listen for notifications and poll the slot
        #[arg(long, short)]
        daemon: bool,

        #[command(flatten)]
        pg: PgArgs,
    },
    /// Full backfill using tuple-id paging across workers
    ParallelSync {
        /// Schema config file
        #[arg(long, short, env = "SCHEMA")]
        config: PathBuf,

        /// Number of workers
        #[arg(long, short, default_value_t = 1)]
        nprocs: usize,

        /// Worker scheduling mode
        #[arg(long, value_enum, default_value_t = SyncMode::Multithreaded)]
        mode: SyncMode,

        #[command(flatten)]
        pg: PgArgs,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SyncMode {
    /// One worker processing work units in order
    Synchronous,
    /// nprocs workers on the shared runtime
    Multithreaded,
    /// Alias of multithreaded; kept for compatibility
    Multiprocess,
}

#[derive(Args, Clone)]
struct PgArgs {
    /// Source database host
    #[arg(long, env = "PG_HOST", default_value = "localhost")]
    host: String,

    /// Source database port
    #[arg(long, short, env = "PG_PORT", default_value_t = 5432)]
    port: u16,

    /// Source database user
    #[arg(long, short, env = "PG_USER", default_value = "postgres")]
    user: String,

    /// Source database password
    #[arg(long, env = "PG_PASSWORD")]
    password: Option<String>,
}

impl From<&PgArgs> for PgOpts {
    fn from(args: &PgArgs) -> Self {
        PgOpts {
            host: args.host.clone(),
            port: args.port,
            user: args.user.clone(),
            password: args.password.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        let code = e
            .downcast_ref::<SyncError>()
            .map(SyncError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Bootstrap {
            config,
            teardown,
            no_create,
            pg,
        } => bootstrap(&config, teardown, no_create, &PgOpts::from(&pg)).await,
        Commands::Sync { config, daemon, pg } => sync(&config, daemon, &PgOpts::from(&pg)).await,
        Commands::ParallelSync {
            config,
            nprocs,
            mode,
            pg,
        } => {
            let workers = match mode {
                SyncMode::Synchronous => 1,
                SyncMode::Multithreaded | SyncMode::Multiprocess => nprocs.max(1),
            };
            backfill(&config, workers, &PgOpts::from(&pg)).await
        }
    }
}

async fn bootstrap(
    config: &PathBuf,
    teardown: bool,
    no_create: bool,
    pg: &PgOpts,
) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    for sync in SyncConfig::load_all(config)? {
        let index = sync.index().to_string();
        let name = sync_name(&sync.database, &index);
        let client = connect::connect(&pg.url(&sync.database)).await?;
        let reflection = Reflection::load(&client, &config_schemas(&sync.nodes)).await?;
        let tree = Tree::build(&sync.nodes, &reflection)?;
        let installer = Installer::new(&client, &tree, &reflection, &sync.database, &index);

        if teardown {
            installer.teardown().await?;
            checkpoint_store(&settings, &name).await?.delete().await?;
            if let Ok(queue) = RedisQueue::connect(&settings.redis_url, &name).await {
                queue.clear().await?;
            }
            info!("teardown of {}:{index} complete", sync.database);
        } else {
            installer.setup(no_create).await?;
            info!("bootstrap of {}:{index} complete", sync.database);
        }
    }
    Ok(())
}

async fn sync(config: &PathBuf, daemon: bool, pg: &PgOpts) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            let _ = ctrl_c_tx.send(());
        }
    });

    let mut engines = Vec::new();
    for sync in SyncConfig::load_all(config)? {
        let index = sync.index().to_string();
        let name = sync_name(&sync.database, &index);
        let uri = pg.url(&sync.database);

        let client = connect::connect(&uri).await?;
        let reflection = Reflection::load(&client, &config_schemas(&sync.nodes)).await?;
        let tree = Arc::new(Tree::build(&sync.nodes, &reflection)?);
        let queue: Arc<dyn EventQueue> =
            Arc::new(RedisQueue::connect(&settings.redis_url, &name).await?);
        let indexer = Arc::new(HttpIndexer::new(&settings)?);
        let store = checkpoint_store(&settings, &name).await?;

        let mut engine = SyncEngine::new(
            &sync.database,
            &index,
            &uri,
            Arc::clone(&tree),
            settings.clone(),
            client,
            Arc::clone(&queue),
            indexer,
            store,
        )
        .await?;
        engine.preflight().await?;

        if daemon {
            // buffer ongoing changes before the catch-up pull so nothing
            // lands between the snapshot and the live stream
            let listener = NotificationListener::new(
                &sync.database,
                &index,
                tree.schemas(),
                Arc::clone(&queue),
                settings.redis_write_chunk_size,
                settings.poll_timeout,
            );
            let listener_uri = uri.clone();
            let listener_shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = listener.run(&listener_uri, listener_shutdown).await {
                    error!("notification listener stopped: {e}");
                }
            });
        }

        engine.pull().await?;

        if daemon {
            let reader = ReplicationReader::new(
                &name,
                tree.tables(),
                settings.logical_slot_chunk_size,
                settings.poll_timeout,
                engine.txmin_committed(),
            );
            let reader_client = connect::connect(&uri).await?;
            let reader_queue = Arc::clone(&queue);
            let indexed = engine.indexed_watch();
            let reader_shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = reader
                    .run(reader_client, reader_queue, indexed, reader_shutdown)
                    .await
                {
                    error!("replication reader stopped: {e}");
                }
            });

            let engine_shutdown = shutdown_tx.subscribe();
            engines.push(tokio::spawn(async move {
                engine.run(engine_shutdown).await
            }));
        }
    }

    for engine in engines {
        engine.await??;
    }
    Ok(())
}

async fn backfill(config: &PathBuf, nprocs: usize, pg: &PgOpts) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    for sync in SyncConfig::load_all(config)? {
        let index = sync.index().to_string();
        let uri = pg.url(&sync.database);
        let client = connect::connect(&uri).await?;
        let reflection = Reflection::load(&client, &config_schemas(&sync.nodes)).await?;
        let tree = Arc::new(Tree::build(&sync.nodes, &reflection)?);
        let indexer = Arc::new(HttpIndexer::new(&settings)?);

        let indexed = parallel_sync(
            &uri,
            &sync.database,
            &index,
            tree,
            settings.clone(),
            indexer,
            nprocs,
        )
        .await?;
        info!("backfilled {indexed} documents into {index}");
    }
    Ok(())
}

async fn checkpoint_store(
    settings: &Settings,
    name: &str,
) -> Result<Box<dyn CheckpointStore>, SyncError> {
    if settings.redis_checkpoint {
        Ok(Box::new(BrokerStore::connect(&settings.redis_url, name).await?))
    } else {
        Ok(Box::new(FileStore::new(&settings.checkpoint_path, name)))
    }
}

/// Schemas referenced anywhere in a node tree.
fn config_schemas(node: &NodeConfig) -> Vec<String> {
    fn collect(node: &NodeConfig, out: &mut Vec<String>) {
        if !out.contains(&node.schema) {
            out.push(node.schema.clone());
        }
        for child in &node.children {
            collect(child, out);
        }
    }
    let mut schemas = Vec::new();
    collect(node, &mut schemas);
    schemas
}
