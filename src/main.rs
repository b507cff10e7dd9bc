use std::{future::pending, process};

use readthrough::{
    application::{cache_admin::CacheAdminService, error::AppError},
    cache::CacheRuntime,
    config,
    infra::{
        error::InfraError,
        http::{self, AdminState, Upstream},
        telemetry,
    },
};
use serde::Serialize;
use tokio::{signal, sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    let runtime = CacheRuntime::initialize(&settings.backend, settings.cache_config())
        .await
        .map_err(InfraError::from)?;

    let result = match command {
        config::Command::Serve(_) => run_serve(&settings, &runtime).await,
        config::Command::Stats(_) => {
            let service = CacheAdminService::from_runtime(&runtime);
            print_json(&service.get_stats().await)
        }
        config::Command::Clear(_) => {
            let service = CacheAdminService::from_runtime(&runtime);
            let outcome = service.clear_cache().await;
            print_json(&outcome)?;
            if outcome.success {
                Ok(())
            } else {
                Err(AppError::unexpected(outcome.message))
            }
        }
        config::Command::Invalidate(args) => {
            let service = CacheAdminService::from_runtime(&runtime);
            let outcome = service
                .invalidate_route(Some(args.route.as_str()))
                .await
                .map_err(|err| AppError::validation(err.to_string()))?;
            print_json(&outcome)
        }
    };

    runtime.shutdown().await;
    result
}

fn print_json(value: &impl Serialize) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_serve(settings: &config::Settings, runtime: &CacheRuntime) -> Result<(), AppError> {
    if settings.upstream.base_url.is_none() {
        warn!(
            target = "readthrough::serve",
            "No upstream configured; proxied requests will answer 502"
        );
    }

    let upstream = Upstream::new(settings.upstream.base_url.clone(), settings.upstream.timeout)
        .map_err(|err| InfraError::configuration(err.to_string()))?;
    let public_router = http::build_router(upstream, runtime.cache_state(), runtime.hub().clone());
    let admin_router = http::build_admin_router(AdminState {
        cache: CacheAdminService::from_runtime(runtime),
    });

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(InfraError::from)?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "readthrough::serve",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "Listening"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(stopped(stop_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(stopped(stop_rx));

    let servers = async { try_join!(public_server, admin_server) };
    tokio::pin!(servers);

    let served = tokio::select! {
        served = &mut servers => served,
        () = shutdown_signal() => {
            let _ = stop_tx.send(true);
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut servers).await {
                Ok(served) => served,
                Err(_) => {
                    warn!(
                        target = "readthrough::serve",
                        timeout_secs = settings.server.graceful_shutdown.as_secs(),
                        "Graceful shutdown timed out, dropping open connections"
                    );
                    Ok(((), ()))
                }
            }
        }
    };

    served.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
    info!(target = "readthrough::serve", "Server shutdown complete");
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(target = "readthrough::serve", "Shutdown signal received");
}
