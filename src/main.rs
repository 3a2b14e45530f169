use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use conntest::config::Config;
use conntest::discovery::{DnsResolver, EndpointDiscovery};
use conntest::export::{MetricsServer, MetricsSink, PrometheusSink};
use conntest::fanout;
use conntest::probe::{run_sequential, ProbeClient};
use conntest::server::{run_alongside, serve, ConnectionHandler};

/// Distributed TCP connectivity probe.
#[derive(Parser)]
#[command(name = "conntest", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set by build.rs, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("conntest {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    // Missing node identity is fatal before anything starts.
    let node_name = cfg.resolve_node_name()?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        node = %node_name,
        "starting conntest",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, node_name).await })
}

async fn run(cfg: Config, node_name: String) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let prometheus = Arc::new(PrometheusSink::new().context("registering metrics")?);
    let sink: Arc<dyn MetricsSink> = prometheus.clone();

    let metrics_server = MetricsServer::new(&cfg.metrics.addr, prometheus.registry().clone());
    metrics_server
        .start()
        .await
        .context("starting metrics server")?;

    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("listening on port {}", cfg.listen_port))?;

    let server = tokio::spawn(serve(
        listener,
        ConnectionHandler::new(sink.clone()),
        cancel.clone(),
    ));

    let client = ProbeClient::new(sink.clone(), node_name).with_timeout(cfg.probe_timeout);

    let discovery = if cfg.discovery.enabled {
        Some(EndpointDiscovery::new(
            DnsResolver::from_system_conf()?,
            cfg.discovery.query(),
            cfg.discovery.retry_policy()?,
            sink,
        ))
    } else {
        None
    };

    let driver = async {
        match &discovery {
            Some(discovery) => {
                fanout::run_cycles(
                    discovery,
                    Arc::new(client),
                    cfg.short_test_bytes,
                    cfg.times_to_send,
                    cfg.pacing(),
                    cancel.clone(),
                )
                .await;
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = run_sequential(
                        &client,
                        &cfg.dest_host,
                        cfg.long_test_bytes,
                        cfg.times_to_send,
                        cfg.pacing(),
                    ) => {
                        if let Err(e) = result {
                            tracing::error!(error = %format!("{e:#}"), "single-destination tests failed");
                        }
                    }
                }
            }
        }
    };

    // An accept-loop failure ends the run and exits non-zero.
    let outcome = run_alongside(server, driver, cancel.clone()).await;

    // Graceful shutdown.
    metrics_server.stop().await?;
    outcome?;

    tracing::info!("conntest stopped");

    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "registering SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });
}
