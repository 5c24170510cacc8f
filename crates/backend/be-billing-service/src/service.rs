use std::sync::Arc;

use be_auth_core::JwtConfig;
use be_billing_db::DatabaseManager;

use crate::catalog::Catalog;
use crate::config::BillingConfig;
use crate::engine::{EngineSettings, ReconciliationEngine};
use crate::error::BillingError;
use crate::gateway::HttpGateway;

pub struct AppState<S, G> {
    pub engine: ReconciliationEngine<S, G>,
    pub config: BillingConfig,
    pub jwt_config: Arc<JwtConfig>,
}

impl AppState<DatabaseManager, HttpGateway> {
    pub fn from_env(db: Arc<DatabaseManager>) -> Result<Self, BillingError> {
        let config = BillingConfig::from_env()?;
        let gateway = HttpGateway::new(config.gateway.clone(), config.callback_url())
            .map_err(|e| BillingError::Config(format!("Failed to build gateway client: {e}")))?;
        let jwt_config = Arc::new(JwtConfig::from_env()?);

        let engine = ReconciliationEngine::new(
            db,
            Arc::new(gateway),
            Catalog::default(),
            EngineSettings::from(&config),
        );

        Ok(Self {
            engine,
            config,
            jwt_config,
        })
    }
}
