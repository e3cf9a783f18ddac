//! Device-profile storage.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::db::Storage;
use crate::error::{Result, StorageError};

/// A device-profile: the boot and capability parameters shared by all
/// devices of one hardware type.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct DeviceProfile {
    pub device_profile_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub supports_class_b: bool,
    pub supports_class_c: bool,
    pub supports_join: bool,
    pub rx_delay_1: i16,
    pub rx_dr_offset_1: i16,
    pub rx_datarate_2: i16,
    pub rx_freq_2: i64,
    pub factory_preset_freqs: Vec<i64>,
    pub ping_slot_period: i32,
    pub ping_slot_dr: i16,
    pub ping_slot_freq: i64,
}

impl Storage {
    /// Create a device-profile, assigning its id and timestamps.
    pub async fn create_device_profile(&self, dp: &mut DeviceProfile) -> Result<()> {
        if dp.device_profile_id.is_nil() {
            dp.device_profile_id = Uuid::new_v4();
        }
        let now = Utc::now();
        dp.created_at = now;
        dp.updated_at = now;

        sqlx::query(
            r#"
            insert into device_profile (
                device_profile_id, created_at, updated_at,
                supports_class_b, supports_class_c, supports_join,
                rx_delay_1, rx_dr_offset_1, rx_datarate_2, rx_freq_2,
                factory_preset_freqs, ping_slot_period, ping_slot_dr, ping_slot_freq
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(dp.device_profile_id)
        .bind(dp.created_at)
        .bind(dp.updated_at)
        .bind(dp.supports_class_b)
        .bind(dp.supports_class_c)
        .bind(dp.supports_join)
        .bind(dp.rx_delay_1)
        .bind(dp.rx_dr_offset_1)
        .bind(dp.rx_datarate_2)
        .bind(dp.rx_freq_2)
        .bind(&dp.factory_preset_freqs)
        .bind(dp.ping_slot_period)
        .bind(dp.ping_slot_dr)
        .bind(dp.ping_slot_freq)
        .execute(self.pg())
        .await?;

        info!(device_profile_id = %dp.device_profile_id, "Device-profile created");
        Ok(())
    }

    /// Get a device-profile by id.
    pub async fn get_device_profile(&self, id: Uuid) -> Result<DeviceProfile> {
        sqlx::query_as::<_, DeviceProfile>(
            "select * from device_profile where device_profile_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pg())
        .await?
        .ok_or(StorageError::NotFound)
    }

    /// Delete a device-profile by id.
    pub async fn delete_device_profile(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("delete from device_profile where device_profile_id = $1")
            .bind(id)
            .execute(self.pg())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        info!(device_profile_id = %id, "Device-profile deleted");
        Ok(())
    }
}
