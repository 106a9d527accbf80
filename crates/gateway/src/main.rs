use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, Semaphore};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use bp_gateway::bruteforce::Bruteforce;
use bp_gateway::cli::{self, Cli, Command, ConfigCommand};
use bp_gateway::cluster;
use bp_gateway::hub::Hub;
use bp_gateway::scheduler;
use bp_gateway::spooler::mail::NoMailTransport;
use bp_gateway::state::{AppState, ClusterState, DISPATCH_PERMITS};
use bp_gateway::ws;
use bp_schema::SchemaCache;
use bp_store::migrate::{self, MigrateCtx};
use bp_store::{ConfigCache, Db, DbLog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(&cli.config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = cli::load_config(&cli.config)?;
            if !cli::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = cli::load_config(&cli.config)?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!(
                "baseplate {} (schema {})",
                bp_domain::VERSION_FULL,
                bp_domain::VERSION_CUT
            );
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bp_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config_path: &std::path::Path) -> anyhow::Result<()> {
    tracing::info!(version = bp_domain::VERSION_FULL, "Baseplate starting");

    // ── Bootstrap config ─────────────────────────────────────────────
    let mut config = cli::load_config(config_path)?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            bp_domain::config::ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            bp_domain::config::ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues
        .iter()
        .any(|i| i.severity == bp_domain::config::ConfigSeverity::Error)
    {
        anyhow::bail!("bootstrap config validation failed");
    }

    // Stable node identity, generated once and written back.
    let node_id = match Uuid::parse_str(&config.cluster.node_id) {
        Ok(id) => id,
        Err(_) => {
            let id = Uuid::new_v4();
            config.cluster.node_id = id.to_string();
            cli::store_config(config_path, &config).context("persisting node id")?;
            tracing::info!(%id, "node id generated");
            id
        }
    };
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.paths.files).context("creating files directory")?;
    std::fs::create_dir_all(&config.paths.transfer).context("creating transfer directory")?;

    // ── Storage gateway + migrations ─────────────────────────────────
    let db = Db::connect(&config.db).await.context("connecting database")?;
    migrate::run(
        &db,
        &MigrateCtx {
            files_root: config.paths.files.clone(),
        },
    )
    .await
    .context("migrating database")?;

    // ── Runtime config + token secret ────────────────────────────────
    let runtime = Arc::new(ConfigCache::new());
    runtime.load(&db).await.context("loading instance config")?;
    bp_gateway::auth::token::ensure_secret(&db, &runtime)
        .await
        .context("ensuring token secret")?;

    // ── Persisted log ────────────────────────────────────────────────
    let log = Arc::new(DbLog::new(db.clone(), runtime.clone(), node_id));
    tracing::info!("persisted log ready");

    // ── Schema cache ─────────────────────────────────────────────────
    let schema = Arc::new(SchemaCache::new());
    bp_schema::load_all(&db, &schema)
        .await
        .context("loading schema cache")?;
    tracing::info!(modules = schema.module_ids().len(), "schema cache ready");

    // ── Transport singletons ─────────────────────────────────────────
    let hub = Arc::new(Hub::new());
    let bruteforce = Arc::new(Bruteforce::new(runtime.clone()));
    let dispatch_permits = Arc::new(Semaphore::new(DISPATCH_PERMITS));
    tracing::info!(permits = DISPATCH_PERMITS, "dispatcher pool ready");

    // ── Cluster ──────────────────────────────────────────────────────
    let (events_tx, events_rx) = mpsc::channel(256);
    let state = AppState {
        cfg: config.clone(),
        db: db.clone(),
        runtime,
        log,
        schema,
        hub,
        bruteforce,
        dispatch_permits,
        node_id,
        cluster: Arc::new(ClusterState::new()),
        events_tx,
        mailer: Arc::new(NoMailTransport),
    };

    cluster::register_node(&db, node_id, &config.cluster.node_name)
        .await
        .context("registering cluster node")?;
    bp_gateway::auth::session::remove_all_for_node(&state)
        .await
        .context("clearing stale sessions")?;
    cluster::check_in(&state).await.context("initial check-in")?;
    scheduler::ensure_function_schedules(&state)
        .await
        .context("seeding function schedules")?;
    tracing::info!(%node_id, master = state.cluster.is_master(), "cluster ready");

    // ── Background loops ─────────────────────────────────────────────
    tokio::spawn(cluster::consume(state.clone(), events_rx));
    tokio::spawn(scheduler::run_loop(state.clone()));
    tokio::spawn(ws::run_remover(state.clone()));
    tracing::info!("background loops running");

    // ── Listener ─────────────────────────────────────────────────────
    let app = ws::router(state.clone());
    let listen = format!("{}:{}", config.web.listen, config.web.port);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "listening");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .into_future();

    tokio::select! {
        result = serve => {
            result.context("server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // ── Orderly shutdown ─────────────────────────────────────────────
    cluster::set_stopped(&db, node_id).await.ok();
    bp_gateway::auth::session::remove_all_for_node(&state).await.ok();
    db.close().await;
    tracing::info!("Baseplate stopped");
    Ok(())
}
