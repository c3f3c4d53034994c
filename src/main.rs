use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::AppState;
use lir_core::memory::{
    InMemoryAuditLog, InMemoryDomainGateway, InMemoryEndpointRegistry, InMemoryJobStore,
    SimulatedTransport,
};
use lir_core::{CoreConfig, Endpoint, InterfaceService};

/// Main entry point for the laboratory interface relay.
///
/// Serves the REST API (with OpenAPI/Swagger documentation) backed by the
/// in-memory adapters.
///
/// # Environment Variables
/// - `LIR_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `LIR_ENDPOINTS_FILE`: path to a JSON array of endpoint definitions to
///   load into the registry at startup
/// - `LIR_ESCALATION_INTERVAL_SECS`: seconds between dead-letter sweeps
///   (default: 3600)
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If startup or runtime fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lir_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("LIR_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let endpoints = match std::env::var("LIR_ENDPOINTS_FILE") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            let endpoints: Vec<Endpoint> = serde_json::from_str(&raw)?;
            tracing::info!("loaded {} endpoint(s) from {}", endpoints.len(), path);
            endpoints
        }
        Err(_) => {
            tracing::warn!(
                "LIR_ENDPOINTS_FILE not set, starting with an empty endpoint registry"
            );
            Vec::new()
        }
    };

    let service = InterfaceService::new(
        Arc::new(InMemoryEndpointRegistry::with_endpoints(endpoints)),
        Arc::new(InMemoryJobStore::new()),
        Arc::new(InMemoryAuditLog::new()),
        Arc::new(InMemoryDomainGateway::with_defaults()),
        Arc::new(SimulatedTransport::accepting()),
        CoreConfig::default(),
    );

    let escalation_secs: u64 = std::env::var("LIR_ESCALATION_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600);
    let sweeper = service.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(escalation_secs.max(1)));
        // The first tick fires immediately; skip it so sweeps start one
        // interval after boot.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweeper.run_escalation() {
                Ok(escalated) if !escalated.is_empty() => {
                    tracing::warn!("moved {} job(s) to dead letter", escalated.len());
                }
                Ok(_) => {}
                Err(err) => tracing::error!("dead-letter sweep failed: {err}"),
            }
        }
    });

    tracing::info!("++ Starting laboratory interface relay REST on {}", rest_addr);

    let app = api_rest::router(AppState { service });
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
