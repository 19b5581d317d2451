use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use taxguard_api::app::{
    build_app,
    services::{AppServices, Collaborators, Stores},
};
use taxguard_api::startup::StartupChecker;
use taxguard_infra::{Settings, UnconfiguredCredentials};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taxguard_observability::init();

    let settings = Arc::new(Settings::from_env().context("invalid configuration")?);

    // Every startup invariant holds before the listener exists.
    let backends = match StartupChecker::new(settings.clone()).run().await {
        Ok(backends) => backends,
        Err(fault) => {
            tracing::error!(error = %fault, "startup invariant violated; refusing to serve");
            return Err(fault.into());
        }
    };

    let services = Arc::new(AppServices::new(
        settings.clone(),
        Stores::persistent(backends),
        Collaborators::new(Arc::new(UnconfiguredCredentials)),
    ));
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
