use std::sync::Arc;

use driftfix_common::{Error, Result};
use driftfix_config::AppConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Binds the configured address and serves the migration trigger.
pub struct GatewayServer {
    config: AppConfig,
}

impl GatewayServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.gateway.host, self.config.gateway.port);

        let state = Arc::new(AppState::from_config(self.config)?);
        info!(
            "serving {} with {} migration steps (latest {})",
            state.database.path().display(),
            state.runner.registry().len(),
            state
                .runner
                .registry()
                .latest_version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".into()),
        );
        let app = build_router(state);

        let listener = TcpListener::bind(&addr).await?;
        info!("driftfix gateway listening on {}", addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Gateway(format!("server error: {e}")))?;

        Ok(())
    }
}
