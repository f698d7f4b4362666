use clap::{Parser, Subcommand};
use fs2::FileExt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use meeting_pool::config::{load_config, PoolConfig};
use meeting_pool::credentials::{get_provider_profile, load_credentials};
use meeting_pool::db::{Db, DynError};
use meeting_pool::ingest::IngestPipeline;
use meeting_pool::lifecycle::Coordinator;
use meeting_pool::pool::AccountPool;
use meeting_pool::provider::HttpMeetingProvider;
use meeting_pool::serve::{serve_api, AppState};
use meeting_pool::sftp::{SftpSettings, SftpStorage};
use meeting_pool::sweeper::Sweeper;
use meeting_pool::workers::spawn_workers;

#[derive(Parser, Debug)]
#[command(author, version, about = "Meeting account pool and recording ingestion service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server with all background worker lanes
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one reconciliation sweep and exit
    Sweep {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Import (create or update) pool accounts from the config file
    ImportAccounts {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Re-queue a failed recording for another ingestion attempt
    Reprocess {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Recording id to re-queue
        recording_id: String,
    },
}

fn main() -> Result<(), DynError> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Serve { config, port } => serve(config, port),
        Command::Sweep { config } => sweep_once(config),
        Command::ImportAccounts { config } => import_accounts(config),
        Command::Reprocess {
            config,
            recording_id,
        } => reprocess(config, &recording_id),
    }
}

fn open_db(config: &PoolConfig) -> Result<Arc<Db>, DynError> {
    Ok(Arc::new(Db::connect(&config.db_path)?))
}

fn build_provider(config: &PoolConfig) -> Result<Arc<HttpMeetingProvider>, DynError> {
    let credentials = load_credentials()?;
    let profile = get_provider_profile(&credentials, &config.provider.credential_profile)?;
    Ok(Arc::new(HttpMeetingProvider::new(
        config.provider.clone(),
        profile,
    )?))
}

fn build_storage(config: &PoolConfig) -> Result<Arc<SftpStorage>, DynError> {
    let credentials = load_credentials()?;
    let settings = SftpSettings::from_storage_config(&config.storage, &credentials)?;
    Ok(Arc::new(SftpStorage::new(settings)))
}

fn serve(config_path: PathBuf, port_override: Option<u16>) -> Result<(), DynError> {
    let config = load_config(&config_path)?;
    let port = port_override.unwrap_or(config.api_port);
    let tuning = config.pool.clone();

    // One serving instance per database
    let lock_path = format!("{}.lock", config.db_path.display());
    let lock_file = File::create(&lock_path)
        .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path, e))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        format!(
            "Another instance is already serving this database. Lock file: {}",
            lock_path
        )
    })?;

    let db = open_db(&config)?;
    let provider = build_provider(&config)?;
    let storage = build_storage(&config)?;

    let pool = Arc::new(AccountPool::new(db.clone()));
    pool.import_accounts(&config.accounts)?;

    let coordinator = Arc::new(Coordinator::new(db.clone(), pool.clone(), provider.clone()));
    let sweeper = Sweeper::new(
        db.clone(),
        pool.clone(),
        Duration::from_secs(tuning.grace_period_secs),
    );
    let pipeline = Arc::new(IngestPipeline::new(
        db.clone(),
        provider,
        storage,
        tuning.max_ingest_attempts,
    ));

    let workers = Arc::new(spawn_workers(
        coordinator.clone(),
        sweeper,
        pipeline.clone(),
        tuning.lifecycle_workers,
        tuning.ingest_workers,
        Duration::from_secs(tuning.sweep_interval_secs),
    ));

    let state = Arc::new(AppState {
        db,
        pool,
        coordinator,
        pipeline,
        workers,
    });

    serve_api(state, port)
}

fn sweep_once(config_path: PathBuf) -> Result<(), DynError> {
    let config = load_config(&config_path)?;
    let db = open_db(&config)?;
    let pool = Arc::new(AccountPool::new(db.clone()));
    let sweeper = Sweeper::new(
        db,
        pool,
        Duration::from_secs(config.pool.grace_period_secs),
    );

    let report = sweeper.sweep()?;
    println!(
        "Sweep complete: {} stuck lesson(s) released, {} account load(s) reconciled",
        report.stuck_released, report.loads_reconciled
    );
    Ok(())
}

fn import_accounts(config_path: PathBuf) -> Result<(), DynError> {
    let config = load_config(&config_path)?;
    let db = open_db(&config)?;
    let pool = AccountPool::new(db);

    let imported = pool.import_accounts(&config.accounts)?;
    println!("Imported {} account(s)", imported);
    for account in pool.list_accounts()? {
        println!(
            "  {} capacity {} load {} {}",
            account.id,
            account.max_concurrent,
            account.current_load,
            if account.active { "active" } else { "inactive" }
        );
    }
    Ok(())
}

fn reprocess(config_path: PathBuf, recording_id: &str) -> Result<(), DynError> {
    let config = load_config(&config_path)?;
    let db = open_db(&config)?;
    let provider = build_provider(&config)?;
    let storage = build_storage(&config)?;
    let pipeline = IngestPipeline::new(db, provider, storage, config.pool.max_ingest_attempts);

    if pipeline.reprocess(recording_id)? {
        println!(
            "Recording {} queued for reprocessing; the serving instance will pick it up",
            recording_id
        );
        Ok(())
    } else {
        Err(format!(
            "Recording '{}' not found or not in a failed state",
            recording_id
        )
        .into())
    }
}
