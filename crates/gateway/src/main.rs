use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_domain::config::{load_env_layers, LogFormat, Settings};
use tether_gateway::bootstrap;
use tether_gateway::runtime::maintenance;

#[derive(Parser)]
#[command(name = "tether-agent", about = "Control plane for AI coding-agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent server (default).
    Serve,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Serve) => {
            load_env_layers();
            let settings = Settings::from_env();
            init_tracing(&settings);
            run_server(settings).await
        }
        Some(Command::Version) => {
            println!("tether-agent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    match settings.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Console => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run_server(settings: Settings) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tether agent starting");

    let host = settings.host.clone();
    let port = settings.port;

    let state = bootstrap::build_state(settings)?;

    // Sessions bound to a chat platform get their router reattached.
    bootstrap::resubscribe_platform_sessions(&state);

    // ── Maintenance (prune + idle interrupts, 60s tick) ──────────────
    tokio::spawn(maintenance::maintenance_loop(state.clone()));

    // ── Periodic store flush ─────────────────────────────────────────
    {
        let store = state.store.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = store.flush() {
                    tracing::warn!(error = %e, "session store flush failed");
                }
            }
        });
    }

    let app = bootstrap::build_app(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("binding to {addr}: {e}"))?;
    tracing::info!(addr = %addr, "tether agent listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;
    Ok(())
}
