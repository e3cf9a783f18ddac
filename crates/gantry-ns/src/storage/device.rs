//! Device storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gantry_lorawan::Eui64;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use tracing::info;
use uuid::Uuid;

use super::db::Storage;
use crate::error::{Result, StorageError};

/// Operating mode of a device. Devices start in class A and switch to B or C
/// after the corresponding capability has been negotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceMode {
    #[default]
    A,
    B,
    C,
}

impl DeviceMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_end() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            other => Err(StorageError::Internal(format!(
                "unknown device mode: {other:?}"
            ))),
        }
    }
}

/// A device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub dev_eui: Eui64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_profile_id: Uuid,
    pub service_profile_id: Uuid,
    pub routing_profile_id: Uuid,
    pub reference_altitude: f64,
    pub mode: DeviceMode,
}

impl FromRow<'_, PgRow> for Device {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let dev_eui: Vec<u8> = row.try_get("dev_eui")?;
        let mode: String = row.try_get("mode")?;

        Ok(Self {
            dev_eui: Eui64::from_slice(&dev_eui).map_err(|e| sqlx::Error::ColumnDecode {
                index: "dev_eui".into(),
                source: Box::new(e),
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            device_profile_id: row.try_get("device_profile_id")?,
            service_profile_id: row.try_get("service_profile_id")?,
            routing_profile_id: row.try_get("routing_profile_id")?,
            reference_altitude: row.try_get("reference_altitude")?,
            mode: mode.parse().map_err(|e: StorageError| sqlx::Error::ColumnDecode {
                index: "mode".into(),
                source: e.to_string().into(),
            })?,
        })
    }
}

impl Storage {
    /// Create a device, assigning its timestamps.
    pub async fn create_device(&self, d: &mut Device) -> Result<()> {
        let now = Utc::now();
        d.created_at = now;
        d.updated_at = now;

        sqlx::query(
            r#"
            insert into device (
                dev_eui, created_at, updated_at,
                device_profile_id, service_profile_id, routing_profile_id,
                reference_altitude, mode
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(d.dev_eui.to_vec())
        .bind(d.created_at)
        .bind(d.updated_at)
        .bind(d.device_profile_id)
        .bind(d.service_profile_id)
        .bind(d.routing_profile_id)
        .bind(d.reference_altitude)
        .bind(d.mode.as_str())
        .execute(self.pg())
        .await?;

        info!(dev_eui = %d.dev_eui, "Device created");
        Ok(())
    }

    /// Get a device by its EUI.
    pub async fn get_device(&self, dev_eui: Eui64) -> Result<Device> {
        sqlx::query_as::<_, Device>("select * from device where dev_eui = $1")
            .bind(dev_eui.to_vec())
            .fetch_optional(self.pg())
            .await?
            .ok_or(StorageError::NotFound)
    }

    /// Update a device's mode and reference altitude.
    pub async fn update_device(&self, d: &mut Device) -> Result<()> {
        d.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            update device set
                updated_at = $2,
                device_profile_id = $3,
                service_profile_id = $4,
                routing_profile_id = $5,
                reference_altitude = $6,
                mode = $7
            where dev_eui = $1
            "#,
        )
        .bind(d.dev_eui.to_vec())
        .bind(d.updated_at)
        .bind(d.device_profile_id)
        .bind(d.service_profile_id)
        .bind(d.routing_profile_id)
        .bind(d.reference_altitude)
        .bind(d.mode.as_str())
        .execute(self.pg())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        info!(dev_eui = %d.dev_eui, "Device updated");
        Ok(())
    }

    /// Delete a device by its EUI. Queue items cascade.
    pub async fn delete_device(&self, dev_eui: Eui64) -> Result<()> {
        let result = sqlx::query("delete from device where dev_eui = $1")
            .bind(dev_eui.to_vec())
            .execute(self.pg())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        info!(dev_eui = %dev_eui, "Device deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_mode_roundtrip() {
        for mode in [DeviceMode::A, DeviceMode::B, DeviceMode::C] {
            assert_eq!(mode.as_str().parse::<DeviceMode>().unwrap(), mode);
        }
        assert!("X".parse::<DeviceMode>().is_err());
    }

    #[test]
    fn device_mode_parse_trims_bpchar_padding() {
        // char(1) columns come back space-padded through some drivers
        assert_eq!("B ".parse::<DeviceMode>().unwrap(), DeviceMode::B);
    }
}
