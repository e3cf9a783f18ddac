//! Routing-profile storage.
//!
//! A routing-profile identifies the application server handling a device,
//! together with the TLS material for the client connection. Empty TLS
//! fields mean the connection is made without transport security.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::db::Storage;
use crate::error::{Result, StorageError};

/// A routing-profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct RoutingProfile {
    pub routing_profile_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// hostname:port of the application server.
    pub as_id: String,
    pub ca_cert: String,
    pub tls_cert: String,
    pub tls_key: String,
}

impl Storage {
    /// Create a routing-profile, assigning its id and timestamps.
    pub async fn create_routing_profile(&self, rp: &mut RoutingProfile) -> Result<()> {
        if rp.routing_profile_id.is_nil() {
            rp.routing_profile_id = Uuid::new_v4();
        }
        let now = Utc::now();
        rp.created_at = now;
        rp.updated_at = now;

        sqlx::query(
            r#"
            insert into routing_profile (
                routing_profile_id, created_at, updated_at,
                as_id, ca_cert, tls_cert, tls_key
            ) values ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(rp.routing_profile_id)
        .bind(rp.created_at)
        .bind(rp.updated_at)
        .bind(&rp.as_id)
        .bind(&rp.ca_cert)
        .bind(&rp.tls_cert)
        .bind(&rp.tls_key)
        .execute(self.pg())
        .await?;

        info!(routing_profile_id = %rp.routing_profile_id, "Routing-profile created");
        Ok(())
    }

    /// Get a routing-profile by id.
    pub async fn get_routing_profile(&self, id: Uuid) -> Result<RoutingProfile> {
        sqlx::query_as::<_, RoutingProfile>(
            "select * from routing_profile where routing_profile_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pg())
        .await?
        .ok_or(StorageError::NotFound)
    }

    /// Delete a routing-profile by id.
    pub async fn delete_routing_profile(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("delete from routing_profile where routing_profile_id = $1")
            .bind(id)
            .execute(self.pg())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        info!(routing_profile_id = %id, "Routing-profile deleted");
        Ok(())
    }
}
