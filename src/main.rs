use anyhow::Context as _;
use clap::Parser as _;
use spiffe_mtls_demo::config::{Cli, ClientSettings, Role, ServerSettings};
use spiffe_mtls_demo::runner;
use tokio_util::sync::CancellationToken;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Usage errors exit with status 2 from here.
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        match cli.role {
            Role::Server(args) => {
                let shutdown = CancellationToken::new();
                tokio::spawn(cancel_on_signal(shutdown.clone()));
                runner::run_server(ServerSettings::from(args), shutdown)
                    .await
                    .context("server failed")?;
                log::info!("Server stopped");
            }
            Role::Client(args) => {
                let greeting = runner::run_client(ClientSettings::from(args))
                    .await
                    .context("client failed")?;
                log::info!("Response from server: {}", greeting.body);
                if !greeting.status.is_success() {
                    anyhow::bail!("server answered {}", greeting.status);
                }
            }
        }
        Ok(())
    })
}

async fn cancel_on_signal(token: CancellationToken) {
    shutdown_signal().await;
    log::info!("Shutdown signal received");
    token.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
