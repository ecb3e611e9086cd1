use clap::Parser;
use heartbeat_listener::{config::Config, server::AcceptServer, CancelSource};
use tracing::{error, info};
use tracing_appender::non_blocking;
// no EnvFilter feature; use a simple level switch via RUST_LOG

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "heartbeat-listener")]
#[command(about = "TCP server with cancellable, heartbeat-polled accepts")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/listener.yaml")]
    config: String,
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // Map RUST_LOG to a max level (debug/info/warn/error/trace)
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = fmt.with_max_level(level).try_init();
}

async fn run_with_config_path_and_shutdown(
    config_path: &str,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_yaml_file(config_path).await?;
    info!(
        "Listener: {} ({}), heartbeat {}ms",
        config.listener.bind, config.listener.network, config.listener.heartbeat_ms
    );

    let server = AcceptServer::new(config)?;
    let cancel = CancelSource::new();
    let serve = server.start(cancel.signal());
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
            return Ok(());
        }
        _ = shutdown => {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    }

    // Returns within one heartbeat plus the drain timeout
    serve.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    info!("Starting heartbeat-listener");
    run_with_config_path_and_shutdown(&args.config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    info!("heartbeat-listener stopped");
    Ok(())
}
