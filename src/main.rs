//! TekScope - Main Entry Point
//!
//! Opens the scope and control panel ports, starts both polling loops and the
//! subscriber listener, and runs until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tekscope_rs::{
    backend::{MemorySource, PortLink, SerialLink, SimulatedPanel, SimulatedScope},
    config::ServiceConfig,
    FanoutRegistry, ScopeService, SubscriberServer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tekscope", version, about = "Serial oscilloscope and control panel bridge")]
struct Cli {
    /// Serial port of the oscilloscope
    #[arg(value_name = "SCOPE_PORT")]
    scope_port: String,

    /// Serial port of the control panel
    #[arg(value_name = "CONTROLS_PORT")]
    controls_port: String,

    /// TCP port for subscribers (overrides the config file)
    #[arg(value_name = "SERVER_PORT")]
    server_port: Option<u16>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Use in-memory devices instead of the serial ports
    #[arg(long)]
    simulate: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file.as_deref())?;

    tracing::info!("Starting TekScope");

    let mut config = ServiceConfig::load_or_default(cli.config.as_deref())?;
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }

    let (scope, panel) = open_links(&cli, &config)?;
    let fanout = Arc::new(FanoutRegistry::new());

    let server_running = Arc::new(AtomicBool::new(true));
    let server = SubscriberServer::bind(
        config.server.address(),
        Arc::clone(&fanout),
        Arc::clone(&server_running),
    )?;
    let server_handle = std::thread::Builder::new()
        .name("subscriber-server".to_string())
        .spawn(move || server.run())?;

    let service = ScopeService::start(&config, scope, panel, Arc::clone(&fanout))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    runtime.block_on(async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Interrupt received");
            }
            _ = wait_for_degraded(&service) => {
                tracing::warn!("A polling loop exited, shutting down");
            }
        }
    });

    tracing::info!("Shutting down...");
    let report = service.stop();
    server_running.store(false, Ordering::SeqCst);
    match server_handle.join() {
        Ok(Ok(served)) => tracing::info!("Served {} subscriber connections", served),
        Ok(Err(e)) => tracing::error!("Subscriber server failed: {}", e),
        Err(_) => tracing::error!("Subscriber server thread panicked"),
    }

    let acquisition = report.acquisition.context("Acquisition loop failed")?;
    let panel = report.panel.context("Control panel loop failed")?;
    tracing::info!("Acquisition: {:?}", acquisition);
    tracing::info!("Control panel: {:?}", panel);
    Ok(())
}

async fn wait_for_degraded(service: &ScopeService) {
    while !service.is_degraded() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn open_links(
    cli: &Cli,
    config: &ServiceConfig,
) -> anyhow::Result<(Box<dyn SerialLink>, Box<dyn SerialLink>)> {
    if cli.simulate {
        tracing::info!(
            "Simulating scope '{}' and panel '{}'",
            cli.scope_port,
            cli.controls_port
        );
        let scope = SimulatedScope::new(config.scope.read_timeout())
            .with_source(MemorySource::Random)
            .with_realtime_capture(true);
        let panel = SimulatedPanel::new(config.panel.read_timeout());
        return Ok((Box::new(scope), Box::new(panel)));
    }

    let scope = PortLink::open_scope(&cli.scope_port, &config.scope)?;
    let panel = PortLink::open_panel(&cli.controls_port, &config.panel)?;
    Ok((Box::new(scope), Box::new(panel)))
}

fn init_logging(
    log_file: Option<&std::path::Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tekscope_rs=debug"));

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path {} has no file name", path.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}
