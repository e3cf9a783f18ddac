//! Service-profile storage.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::db::Storage;
use crate::error::{Result, StorageError};

/// A service-profile. The core only needs its identity; the service-level
/// rate and metadata fields live with the enclosing API layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct ServiceProfile {
    pub service_profile_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    /// Create a service-profile, assigning its id and timestamps.
    pub async fn create_service_profile(&self, sp: &mut ServiceProfile) -> Result<()> {
        if sp.service_profile_id.is_nil() {
            sp.service_profile_id = Uuid::new_v4();
        }
        let now = Utc::now();
        sp.created_at = now;
        sp.updated_at = now;

        sqlx::query(
            "insert into service_profile (service_profile_id, created_at, updated_at) values ($1, $2, $3)",
        )
        .bind(sp.service_profile_id)
        .bind(sp.created_at)
        .bind(sp.updated_at)
        .execute(self.pg())
        .await?;

        info!(service_profile_id = %sp.service_profile_id, "Service-profile created");
        Ok(())
    }

    /// Get a service-profile by id.
    pub async fn get_service_profile(&self, id: Uuid) -> Result<ServiceProfile> {
        sqlx::query_as::<_, ServiceProfile>(
            "select * from service_profile where service_profile_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pg())
        .await?
        .ok_or(StorageError::NotFound)
    }

    /// Delete a service-profile by id.
    pub async fn delete_service_profile(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("delete from service_profile where service_profile_id = $1")
            .bind(id)
            .execute(self.pg())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        info!(service_profile_id = %id, "Service-profile deleted");
        Ok(())
    }
}
