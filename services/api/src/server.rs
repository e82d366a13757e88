use crate::cli::ServeArgs;
use crate::infra::{
    build_services, spawn_notification_worker, AppState, ChannelNotifier, ServiceStack,
    NOTIFICATION_QUEUE_DEPTH,
};
use crate::routes::with_visit_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use krg_evisit::config::AppConfig;
use krg_evisit::error::AppError;
use krg_evisit::telemetry;
use krg_evisit::workflows::visit::SystemClock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let (notifier, outbox) = ChannelNotifier::channel(NOTIFICATION_QUEUE_DEPTH);
    spawn_notification_worker(outbox);
    let (services, _store) = build_services(&config.security, notifier, Arc::new(SystemClock));

    if let Some(interval) = config.sweep.interval {
        spawn_overstay_sweep(services.clone(), interval);
    }

    let app = with_visit_routes(services)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "visitor permit service ready");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs the overstay sweep on a fixed interval, skipping the immediate first tick.
fn spawn_overstay_sweep(services: ServiceStack, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let applications = services.applications.clone();
            match tokio::task::spawn_blocking(move || applications.detect_and_flag_overstays())
                .await
            {
                Ok(Ok(report)) => info!(
                    examined = report.examined,
                    flagged = report.flagged.len(),
                    "scheduled overstay sweep complete"
                ),
                Ok(Err(err)) => error!(code = err.code(), error = %err, "scheduled overstay sweep failed"),
                Err(err) => error!(error = %err, "overstay sweep task panicked"),
            }
        }
    });
}
