//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::payment::PaymentClient;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: Arc<AuthService>,
    /// Payment gateway client.
    pub payment: Arc<PaymentClient>,
}

impl AppState {
    /// Create application state from config and an open database.
    pub fn new(config: Config, db: Database) -> Result<Self> {
        let auth = AuthService::new(db.clone(), &config.auth.secret, config.auth.token_minutes);
        let payment = PaymentClient::new(
            &config.payment.gateway_url,
            &config.payment.phone,
            config.payment.timeout_seconds,
        )?;

        Ok(Self {
            config: Arc::new(config),
            db,
            auth: Arc::new(auth),
            payment: Arc::new(payment),
        })
    }
}
