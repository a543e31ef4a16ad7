//! Operator credential re-entry for sensitive ledger operations.

use service_core::error::AppError;
use service_core::utils::{hash_password, verify_password, Password, PasswordHashString};
use sqlx::PgPool;
use tracing::{instrument, warn};

use crate::services::database::db_error;
use crate::services::metrics::record_error;

#[derive(Clone)]
pub struct CredentialVerifier {
    pool: PgPool,
}

impl CredentialVerifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check a re-entered password. Unknown actors and wrong passwords get
    /// the same answer.
    #[instrument(skip(self, password))]
    pub async fn verify(&self, actor_id: &str, password: &Password) -> Result<(), AppError> {
        if password.is_empty() {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Credential re-entry is required"
            )));
        }

        let stored: Option<String> = sqlx::query_scalar(
            "SELECT password_hash FROM operator_credentials WHERE actor_id = $1",
        )
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load operator credential"))?;

        let Some(stored) = stored else {
            record_error("credential_rejected");
            warn!("No credential on file for actor");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Credential verification failed"
            )));
        };

        verify_password(password, &PasswordHashString::new(stored)).inspect_err(|_| {
            record_error("credential_rejected");
            warn!("Credential re-entry rejected");
        })
    }

    /// Store or replace an operator's credential.
    #[instrument(skip(self, password))]
    pub async fn set_credential(&self, actor_id: &str, password: &Password) -> Result<(), AppError> {
        let hash = hash_password(password)?;
        sqlx::query(
            r#"
            INSERT INTO operator_credentials (actor_id, password_hash)
            VALUES ($1, $2)
            ON CONFLICT (actor_id)
            DO UPDATE SET password_hash = EXCLUDED.password_hash, updated_utc = NOW()
            "#,
        )
        .bind(actor_id)
        .bind(hash.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to store operator credential"))?;
        Ok(())
    }
}
