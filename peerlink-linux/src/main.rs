// Peerlink Linux: listens, discovers LAN peers, exchanges peer lists and pings them.

use peerlink_linux::{config, Node};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut trace = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peerlink-linux {}", VERSION);
                return Ok(());
            }
            "--trace" => trace = true,
            _ => {}
        }
    }

    let cfg = config::load();
    let filter = if trace {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let token = CancellationToken::new();
        let node = Node::start(&cfg, token.clone()).await?;
        tracing::info!(version = VERSION, addr = %node.listener_address(), "peerlink running");
        shutdown_signal().await?;
        tracing::info!("shutting down");
        token.cancel();
        anyhow::Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
