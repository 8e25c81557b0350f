mod daycare;
mod metrics;
mod registry;
mod storage;
mod ta;

use anyhow::{anyhow, bail, Context, Result};
use axum::Router;
use bollard::Docker;
use chrono::Utc;
use clap::Parser;
use codegrinder_common::types::REGISTRATION_INTERVAL_SECONDS;
use codegrinder_common::{Config, DaycareRegistration, Version};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use daycare::problem_types::ProblemTypeRegistry;
use metrics::Metrics;
use registry::Registry;

#[derive(Parser)]
#[command(name = "codegrinder")]
#[command(about = "CodeGrinder server - grades student code in sandboxed containers", long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = "/etc/codegrinder/config.json")]
    config: PathBuf,

    /// Serve the TA role (signing, routing, persistence)
    #[arg(long)]
    ta: bool,

    /// Serve the daycare role (sandboxed sessions)
    #[arg(long)]
    daycare: bool,
}

pub struct AppState {
    pub config: Config,
    pub secret: Vec<u8>,
    pub problem_types: Arc<ProblemTypeRegistry>,
    pub registry: Registry,
    pub redis: Option<redis::aio::ConnectionManager>,
    pub docker: Option<Docker>,
    pub metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    if !args.ta && !args.daycare {
        bail!("must run at least one role (--ta/--daycare)");
    }

    info!("CodeGrinder booting...");
    let config = Config::load(&args.config)?;
    let secret = config.secret();

    let problem_types = Arc::new(ProblemTypeRegistry::load_or_builtin(Path::new(
        &config.problem_types_file,
    ))?);
    info!(problem_types = ?problem_types.names(), "problem-type table loaded");

    let mut docker = None;
    if args.daycare {
        config.validate_daycare()?;
        for served in &config.problem_types {
            problem_types
                .get(served)
                .map_err(|err| anyhow!("served problem type is not configured: {err}"))?;
        }

        let client =
            Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;
        client.ping().await.context("Docker ping failed")?;
        info!("connected to Docker engine");
        docker = Some(client);
    }

    let mut redis_conn = None;
    if args.ta {
        let client = redis::Client::open(config.redis_url.as_str())
            .context("failed to create Redis client")?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;
        info!(redis_url = %config.redis_url, "connected to Redis");
        redis_conn = Some(conn);
    }

    let state = Arc::new(AppState {
        registry: Registry::new(secret.clone()),
        secret,
        problem_types,
        redis: redis_conn,
        docker,
        metrics: Metrics::default(),
        config: config.clone(),
    });

    let mut app = Router::new();
    if args.daycare {
        app = app.merge(daycare::routes());
    }
    if args.ta {
        app = app.merge(ta::routes());
    }
    let app = app
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics::track,
        ))
        .with_state(state.clone());

    if args.daycare {
        tokio::spawn(registration_loop(
            config.clone(),
            state.secret.clone(),
            args.ta,
        ));
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, ta = args.ta, daycare = args.daycare, "accepting connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    warn!("received CTRL+C - shutting down");
}

/// Re-register with the TA every interval, logging only on state changes so
/// a flapping TA does not flood the log.
async fn registration_loop(config: Config, secret: Vec<u8>, also_ta: bool) {
    if also_ta {
        // give our own TA listener a chance to come up
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let client = reqwest::Client::new();
    let url = format!("http://{}/v2/daycare_registrations", config.ta_hostname);
    let mut status = "";

    loop {
        let mut reg = DaycareRegistration {
            hostname: config.hostname.clone(),
            problem_types: config.problem_types.clone(),
            capacity: config.capacity,
            time: Utc::now(),
            version: Version::current().version,
            signature: String::new(),
        };
        reg.signature = reg.compute_signature(&secret);

        match client.post(&url).json(&reg).send().await {
            Ok(response) if response.status().is_success() => {
                if status != "succeeded" {
                    info!(url = %url, "registered with TA");
                }
                status = "succeeded";
            }
            Ok(response) => {
                if status != "failed" {
                    let code = response.status();
                    let body = response.text().await.unwrap_or_default();
                    warn!(url = %url, status = %code, body = %body, "daycare registration rejected");
                }
                status = "failed";
            }
            Err(err) => {
                if status != "failed" {
                    warn!(url = %url, error = %err, "error connecting to register daycare");
                }
                status = "failed";
            }
        }

        tokio::time::sleep(Duration::from_secs(REGISTRATION_INTERVAL_SECONDS as u64)).await;
    }
}
