//! signalboard: binary entrypoint.
//! Boots the Axum HTTP server with the agent API, cron triggers and metrics.

use shuttle_axum::ShuttleAxum;
use tracing::warn;

use signalboard::config::{AiConfig, AppConfig};
use signalboard::metrics::Metrics;
use signalboard::{build_state, router, telemetry};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let config = AppConfig::load_default()?;
    let ai = AiConfig::load_default()?;
    let state = build_state(config, &ai).await?;

    let mut app = router(state);
    match Metrics::init() {
        Ok(metrics) => app = app.merge(metrics.router()),
        Err(e) => warn!(error = %e, "metrics disabled"),
    }
    Ok(app.into())
}
