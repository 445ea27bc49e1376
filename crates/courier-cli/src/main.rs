mod cli;
mod http;
mod tasks;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use courier_core::AppBuilder;
use courier_core::app::{DrainReport, ShutdownCoordinator};
use courier_core::impls::InMemoryBroker;
use courier_core::ports::Broker;
use courier_core::typed::Task;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, ServeArgs, init_tracing};
use crate::http::HttpState;
use crate::tasks::{PingHandler, PingTask};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format)?;

    let result = match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::CheckConfig(args) => check_config(args),
    };
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "fatal");
    }
    result
}

fn check_config(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.to_config()?;
    println!("{config:#?}");
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.to_config()?;

    let broker = Arc::new(InMemoryBroker::with_visibility_timeout(
        config.visibility_timeout,
    ));
    broker.declare_queues(config.queue_names()).await;
    broker
        .ping()
        .await
        .context("broker is not reachable at startup")?;

    let app = AppBuilder::new(config.clone())
        .register::<PingTask, _>(PingHandler)?
        .with_default_interceptors()
        .expect_tasks(&[PingTask::TYPE])
        .build(broker)?;
    let coordinator = Arc::clone(app.coordinator());

    info!(
        queues = ?config.queue_names(),
        dispatch_policy = %config.dispatch_policy,
        concurrency = config.concurrency,
        "worker pool starting"
    );
    let dispatcher = app.spawn_dispatcher();

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            app.shutdown("http listener failed to bind").await;
            coordinator.release_resources().await;
            return Err(err).with_context(|| format!("failed to bind {}", config.listen_addr));
        }
    };
    info!(addr = %config.listen_addr, "http listener started");

    tokio::spawn(watch_signals(Arc::clone(&coordinator)));

    let router = http::router(HttpState {
        client: app.client().clone(),
        coordinator: Arc::clone(&coordinator),
        dispatch_policy: config.dispatch_policy,
    });
    let mut server = tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(coordinator.draining())
            .into_future(),
    );

    // サーバーが先に落ちた場合も Draining に入れる
    tokio::select! {
        _ = coordinator.draining() => {}
        exited = &mut server => {
            match exited {
                Ok(Ok(())) => warn!("http server exited before shutdown was requested"),
                Ok(Err(err)) => error!(error = %err, "http server failed"),
                Err(err) => error!(error = %err, "http server task panicked"),
            }
            coordinator.request_shutdown("http server exited");
        }
    }
    info!(state = %coordinator.state(), "shutting down");

    if !server.is_finished() {
        match tokio::time::timeout(config.http_drain_timeout, &mut server).await {
            Ok(_) => info!("http listener drained"),
            Err(_) => {
                warn!(
                    timeout_ms = config.http_drain_timeout.as_millis() as u64,
                    "http shutdown timed out, aborting open connections"
                );
                server.abort();
            }
        }
    }

    match dispatcher.await {
        Ok(stats) => info!(dispatched = stats.total(), per_queue = ?stats.per_queue, "dispatcher stopped"),
        Err(err) => error!(error = %err, "dispatcher task failed"),
    }

    match app.shutdown("process exit").await {
        DrainReport::Graceful { elapsed } => {
            info!(elapsed_ms = elapsed.as_millis() as u64, "worker pool drained")
        }
        DrainReport::Forced { abandoned, .. } => {
            for task in &abandoned {
                warn!(
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    queue = %task.queue,
                    attempt = task.attempt,
                    "task abandoned at shutdown"
                );
            }
        }
    }

    let released = coordinator.release_resources().await;
    info!(resources = ?released, "shutdown complete");
    Ok(())
}

/// SIGINT / SIGTERM を Draining 要求に変換する
async fn watch_signals(coordinator: Arc<ShutdownCoordinator>) {
    let signal = wait_for_signal().await;
    info!(signal, "termination signal received");
    coordinator.request_shutdown(signal);
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
