//! mirrorctl - command-line runner for the Square merchant mirror
//!
//! # Commands
//!
//! - `sync` - Mirror customers, payments and orders into the local database
//! - `token` - Check that a usable access token can be obtained
//! - `import-token` - Store a token response from the authorization handshake
//! - `watermarks` - List per-resource sync watermarks

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use mirror::{
    FailureKind, MirrorConfig, Resource, ShutdownSignal, SquareAuth, SquareClient, SqliteStore,
    SyncEngine, SyncError, ThreadSleeper, TokenGrant, TokenManager, WatermarkStore,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Incrementally mirror Square merchant data into SQLite.
#[derive(Parser)]
#[command(name = "mirrorctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.config/mirror/mirror.json)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Database file (overrides the configured path)
    #[arg(global = true, long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror resources for a merchant account
    Sync {
        /// Merchant account id
        #[arg(short, long)]
        account: String,

        /// Resources to sync (customers, payments, orders); all when omitted
        #[arg(short, long)]
        resource: Vec<Resource>,

        /// Records requested per page
        #[arg(short, long)]
        page_size: Option<usize>,

        /// Stop waiting out rate limits after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Check that a valid access token can be obtained (never prints it)
    Token {
        /// Merchant account id
        #[arg(short, long)]
        account: String,
    },

    /// Store a token endpoint response (JSON file) as the account's credential
    ImportToken {
        /// Merchant account id
        #[arg(short, long)]
        account: String,

        /// Path to the token response JSON
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List sync watermarks
    Watermarks,
}

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    // Bootstrap config and data directories
    if let Err(e) = config::init() {
        warn!("Failed to initialize config directories: {:#}", e);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = match &cli.config {
        Some(path) => MirrorConfig::from_file(path)?,
        None => MirrorConfig::load()?,
    };
    let db_path = match cli.db {
        Some(path) => path,
        None => cfg.database_path()?,
    };

    match cli.command {
        Commands::Sync {
            account,
            resource,
            page_size,
            deadline_secs,
        } => {
            let resources = if resource.is_empty() {
                Resource::ALL.to_vec()
            } else {
                resource
            };
            let page_size = page_size.unwrap_or(cfg.page_size);
            let deadline = deadline_secs.map(Duration::from_secs);
            run_sync(&cfg, &db_path, &account, &resources, page_size, deadline)
        }
        Commands::Token { account } => {
            let store = open_store(&db_path)?;
            let tokens = token_manager(&cfg, store);
            match tokens.get_access_token(&account) {
                Ok(_) => {
                    println!("Access token for {} is valid", account);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report_failure(&account, &e)),
            }
        }
        Commands::ImportToken { account, file } => {
            let grant: TokenGrant = config::load_json_file(&file)?;
            if let Some(merchant) = grant.merchant_id.as_deref().filter(|m| *m != account) {
                warn!(
                    "Token response belongs to merchant {}, storing it for {}",
                    merchant, account
                );
            }
            let store = open_store(&db_path)?;
            let tokens = token_manager(&cfg, store);
            match tokens.store_grant(&account, grant) {
                Ok(credential) => {
                    println!(
                        "Stored credential for {} (expires {})",
                        account, credential.access_expiry
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report_failure(&account, &e)),
            }
        }
        Commands::Watermarks => {
            let store = open_store(&db_path)?;
            let marks = store.list_watermarks()?;
            if marks.is_empty() {
                println!("No resource has been synced yet");
            }
            for mark in marks {
                println!("{:<10} {}", mark.resource.as_str(), mark.last_synced_at.to_rfc3339());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_sync(
    cfg: &MirrorConfig,
    db_path: &Path,
    account: &str,
    resources: &[Resource],
    page_size: usize,
    deadline: Option<Duration>,
) -> Result<ExitCode> {
    let store = open_store(db_path)?;
    let tokens = Arc::new(token_manager(cfg, store.clone()));

    let mut client = SquareClient::new().with_location_ids(cfg.location_ids.clone());
    if let Some(base_url) = &cfg.api_base_url {
        client = client.with_base_url(base_url.as_str());
    }
    if resources.contains(&Resource::Orders) && cfg.location_ids.is_empty() {
        warn!("No location ids configured (SQUARE_LOCATION_IDS), orders cannot be listed");
    }

    let shutdown = ShutdownSignal::new();
    if let Some(deadline) = deadline {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(deadline);
            info!("Deadline of {}s reached, interrupting backoff", deadline.as_secs());
            shutdown.trigger();
        });
    }

    let engine = SyncEngine::new(tokens, Arc::new(client), store.clone(), store)
        .with_backoff(cfg.backoff_policy())
        .with_sleeper(Arc::new(ThreadSleeper::new(shutdown)));

    info!(
        "Syncing {} for account {} into {}",
        resources.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", "),
        account,
        db_path.display()
    );

    let mut code = ExitCode::SUCCESS;
    for (resource, result) in engine.sync_all(account, resources, page_size) {
        match result {
            Ok(stats) => {
                println!(
                    "{:<10} stored {:>6}  skipped {:>6}  invalid {:>4}  pages {:>4}  {}",
                    resource.as_str(),
                    stats.records_stored,
                    stats.records_skipped,
                    stats.records_invalid,
                    stats.pages_fetched,
                    match &stats.stopped_early {
                        Some(reason) => format!("stopped early: {}", reason),
                        None => "complete".to_string(),
                    }
                );
                if stats.stopped_early.is_some() {
                    code = ExitCode::from(3);
                }
            }
            Err(e) => code = report_failure(account, &e),
        }
    }
    Ok(code)
}

fn open_store(db_path: &Path) -> Result<Arc<SqliteStore>> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
    }
    Ok(Arc::new(SqliteStore::open(db_path)?))
}

fn token_manager(cfg: &MirrorConfig, store: Arc<SqliteStore>) -> TokenManager {
    let application_id = match cfg.application_id() {
        Ok(id) => id,
        Err(e) => {
            warn!("{:#}; expired tokens cannot be refreshed", e);
            ""
        }
    };
    let mut auth = SquareAuth::new(application_id, cfg.application_secret.clone());
    if let Some(url) = &cfg.token_url {
        auth = auth.with_token_url(url.as_str());
    }
    TokenManager::new(store, Arc::new(auth))
}

/// Log a failure and pick an exit code by what the user can do about it
fn report_failure(account: &str, err: &SyncError) -> ExitCode {
    error!("{}", err_chain(err));
    match err.kind() {
        FailureKind::NeedsReauthorization => {
            eprintln!(
                "Account {} must be re-authorized, then run \
                 `mirrorctl import-token --account {} --file <token.json>`",
                account, account
            );
            ExitCode::from(2)
        }
        FailureKind::Transient => ExitCode::from(3),
        FailureKind::StorageUnavailable => ExitCode::from(4),
    }
}

fn err_chain(err: &SyncError) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
