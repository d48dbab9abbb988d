use std::path::PathBuf;
use std::sync::Arc;

use atrelay_core::config::{self, BridgeConfig};
use atrelay_core::{BlueskyClient, FeedSource, FeedStore};
use atrelay_server::{BridgeServer, ServerContext, ServerError, SessionSettings};
use clap::Parser;
use miette::Result;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

const LOG_FILE: &str = "atrelay.log";

#[derive(Parser, Debug)]
#[command(name = "atrelay")]
#[command(about = "Read your Bluesky home timeline from any IRC client", long_about = None)]
#[command(version)]
struct Cli {
    /// Port to listen on (default 6667)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (default 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file to use instead of the standard locations
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Command line flags win over file and environment.
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(port) = self.port {
            config.irc.port = port;
        }
        if let Some(host) = &self.host {
            config.irc.host = host.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .rgb_colors(miette::RgbColors::Preferred)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))?;
    miette::set_panic_hook();
    let cli = Cli::parse();

    let _log_guard = init_tracing(cli.verbose);
    info!("atrelay {} starting up", env!("CARGO_PKG_VERSION"));

    let mut config = if let Some(config_path) = &cli.config {
        info!("Loading config from: {:?}", config_path);
        config::load_config(config_path).await?
    } else {
        config::load_config_from_standard_locations().await?
    };
    config.apply_env();
    cli.apply(&mut config);
    config.validate()?;
    let credentials = config.credentials()?;

    info!("Logging in to {} as {}", config.bluesky.service, credentials.handle);
    let client = Arc::new(BlueskyClient::new(
        config.bluesky.service.clone(),
        config.bluesky.timeline_limit,
    ));
    let profile = client.login(&credentials).await?;

    let store = Arc::new(FeedStore::new(client, config.sync.retained_appended));
    let count = store.refresh().await?;
    info!("Timeline loaded with {} entries", count);

    let settings = SessionSettings::from_config(&config, profile.handle);
    let ctx = Arc::new(ServerContext::new(settings, store));
    let server = BridgeServer::bind(ctx.clone(), &config).await?;
    tokio::spawn(watch_signals(ctx));

    match server.serve().await {
        Ok(()) => {
            info!("Server shutdown complete");
            Ok(())
        }
        Err(e @ ServerError::ShutdownTimeout { .. }) => {
            error!("{}, forcing exit", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

/// Terminal output filtered by verbosity, plus a daily log file under the
/// local data dir. The returned guard flushes the file writer on drop.
fn init_tracing(verbose: bool) -> WorkerGuard {
    use tracing_appender::rolling;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("atrelay")
        .join("logs");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = rolling::daily(&log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("atrelay_core=debug,atrelay_server=debug,atrelay=debug,info")
        } else {
            EnvFilter::new("atrelay_core=info,atrelay_server=info,atrelay=info,warn")
        }
    });

    let terminal_layer = if verbose {
        fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .pretty()
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .compact()
            .boxed()
    };

    let file_layer = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(terminal_layer.with_filter(env_filter))
        .with(file_layer.with_filter(EnvFilter::new(
            "atrelay_core=debug,atrelay_server=debug,atrelay=debug,info",
        )))
        .init();

    info!("Logs are being written to: {:?}", log_dir.join(LOG_FILE));
    guard
}

/// First SIGINT/SIGTERM starts a graceful shutdown; a second one exits at once.
async fn watch_signals(ctx: Arc<ServerContext>) {
    loop {
        match wait_for_signal().await {
            Ok(name) if ctx.is_shutting_down() => {
                warn!("Received {} during shutdown, forcing exit", name);
                std::process::exit(1);
            }
            Ok(name) => {
                info!("Received exit signal {}", name);
                ctx.shutdown();
            }
            Err(e) => {
                error!("Failed to listen for shutdown signals: {}", e);
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
