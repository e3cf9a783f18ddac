//! Downlink device-queue storage.
//!
//! Pending downlinks are persisted per device and emitted in ascending
//! frame-counter order. The scheduling primitive enforces the payload-size,
//! frame-counter and pending-acknowledgement policy, discarding unsuitable
//! head items and notifying the application server about each discard.

use std::time::Duration;

use chrono::{DateTime, Utc};
use gantry_lorawan::{gps, DevAddr, Eui64};
use gantry_proto::v1::{ErrorType, HandleDownlinkAckRequest, HandleErrorRequest};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Postgres, Row, Transaction};
use tracing::{error, info};
use uuid::Uuid;

use super::db::Storage;
use super::device::Device;
use crate::asclient;
use crate::error::{Result, StorageError};

/// One pending downlink for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceQueueItem {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dev_addr: DevAddr,
    pub dev_eui: Eui64,
    pub frm_payload: Vec<u8>,
    /// Network downlink frame-counter; items emit in ascending order.
    pub f_cnt: u32,
    /// Application port. 0 is reserved for MAC-layer traffic and rejected.
    pub f_port: u8,
    pub confirmed: bool,
    /// Set while the device is expected to acknowledge this item. At most
    /// one item per device is pending, and it is the head of the queue.
    pub is_pending: bool,
    /// Class-B emission slot relative to the GPS epoch.
    pub emit_at_time_since_gps_epoch: Option<Duration>,
    /// When a pending item is not acknowledged before this instant, it is
    /// discarded and a negative ACK is reported.
    pub timeout_after: Option<DateTime<Utc>>,
}

impl DeviceQueueItem {
    /// Validate the queue item constraints.
    pub fn validate(&self) -> Result<()> {
        if self.f_port == 0 {
            return Err(StorageError::InvalidFPort);
        }
        Ok(())
    }
}

impl FromRow<'_, PgRow> for DeviceQueueItem {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let dev_addr: Vec<u8> = row.try_get("dev_addr")?;
        let dev_eui: Vec<u8> = row.try_get("dev_eui")?;
        let f_cnt: i64 = row.try_get("f_cnt")?;
        let f_port: i16 = row.try_get("f_port")?;
        let emit_at: Option<i64> = row.try_get("emit_at_time_since_gps_epoch")?;

        let column = |name: &str, e: Box<dyn std::error::Error + Send + Sync>| {
            sqlx::Error::ColumnDecode {
                index: name.into(),
                source: e,
            }
        };

        Ok(Self {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            dev_addr: DevAddr::from_slice(&dev_addr)
                .map_err(|e| column("dev_addr", Box::new(e)))?,
            dev_eui: Eui64::from_slice(&dev_eui).map_err(|e| column("dev_eui", Box::new(e)))?,
            frm_payload: row.try_get("frm_payload")?,
            f_cnt: u32::try_from(f_cnt).map_err(|e| column("f_cnt", Box::new(e)))?,
            f_port: u8::try_from(f_port).map_err(|e| column("f_port", Box::new(e)))?,
            confirmed: row.try_get("confirmed")?,
            is_pending: row.try_get("is_pending")?,
            emit_at_time_since_gps_epoch: emit_at
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
            timeout_after: row.try_get("timeout_after")?,
        })
    }
}

/// A feedback event produced by the scheduling discard loop. Buffered while
/// the transaction is open and flushed after commit, in production order.
enum AsNotification {
    Nack {
        f_cnt: u32,
    },
    Error {
        error_type: ErrorType,
        error: String,
        f_cnt: u32,
    },
}

impl Storage {
    /// Create a device-queue item, assigning its id and timestamps.
    pub async fn create_device_queue_item(&self, qi: &mut DeviceQueueItem) -> Result<()> {
        qi.validate()?;

        let now = Utc::now();
        qi.created_at = now;
        qi.updated_at = now;

        let row: (i64,) = sqlx::query_as(
            r#"
            insert into device_queue (
                created_at, updated_at, dev_addr, dev_eui, frm_payload,
                f_cnt, f_port, confirmed, is_pending,
                emit_at_time_since_gps_epoch, timeout_after
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            returning id
            "#,
        )
        .bind(qi.created_at)
        .bind(qi.updated_at)
        .bind(qi.dev_addr.to_vec())
        .bind(qi.dev_eui.to_vec())
        .bind(&qi.frm_payload)
        .bind(i64::from(qi.f_cnt))
        .bind(i16::from(qi.f_port))
        .bind(qi.confirmed)
        .bind(qi.is_pending)
        .bind(
            qi.emit_at_time_since_gps_epoch
                .map(|d| d.as_millis() as i64),
        )
        .bind(qi.timeout_after)
        .fetch_one(self.pg())
        .await?;
        qi.id = row.0;

        info!(dev_eui = %qi.dev_eui, f_cnt = qi.f_cnt, "Device-queue item created");
        Ok(())
    }

    /// Get a device-queue item by id.
    pub async fn get_device_queue_item(&self, id: i64) -> Result<DeviceQueueItem> {
        sqlx::query_as::<_, DeviceQueueItem>("select * from device_queue where id = $1")
            .bind(id)
            .fetch_optional(self.pg())
            .await?
            .ok_or(StorageError::NotFound)
    }

    /// Update a device-queue item.
    pub async fn update_device_queue_item(&self, qi: &mut DeviceQueueItem) -> Result<()> {
        qi.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            update device_queue set
                updated_at = $2,
                dev_addr = $3,
                dev_eui = $4,
                frm_payload = $5,
                f_cnt = $6,
                f_port = $7,
                confirmed = $8,
                is_pending = $9,
                emit_at_time_since_gps_epoch = $10,
                timeout_after = $11
            where id = $1
            "#,
        )
        .bind(qi.id)
        .bind(qi.updated_at)
        .bind(qi.dev_addr.to_vec())
        .bind(qi.dev_eui.to_vec())
        .bind(&qi.frm_payload)
        .bind(i64::from(qi.f_cnt))
        .bind(i16::from(qi.f_port))
        .bind(qi.confirmed)
        .bind(qi.is_pending)
        .bind(
            qi.emit_at_time_since_gps_epoch
                .map(|d| d.as_millis() as i64),
        )
        .bind(qi.timeout_after)
        .execute(self.pg())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        info!(dev_eui = %qi.dev_eui, id = qi.id, "Device-queue item updated");
        Ok(())
    }

    /// Delete a device-queue item by id.
    pub async fn delete_device_queue_item(&self, id: i64) -> Result<()> {
        let result = sqlx::query("delete from device_queue where id = $1")
            .bind(id)
            .execute(self.pg())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        info!(id = id, "Device-queue item deleted");
        Ok(())
    }

    /// All queue items for a device, in ascending frame-counter order.
    pub async fn get_device_queue_items_for_dev_eui(
        &self,
        dev_eui: Eui64,
    ) -> Result<Vec<DeviceQueueItem>> {
        Ok(sqlx::query_as::<_, DeviceQueueItem>(
            "select * from device_queue where dev_eui = $1 order by f_cnt",
        )
        .bind(dev_eui.to_vec())
        .fetch_all(self.pg())
        .await?)
    }

    /// Delete all queue items for a device.
    pub async fn flush_device_queue_for_dev_eui(&self, dev_eui: Eui64) -> Result<()> {
        let result = sqlx::query("delete from device_queue where dev_eui = $1")
            .bind(dev_eui.to_vec())
            .execute(self.pg())
            .await?;

        info!(dev_eui = %dev_eui, count = result.rows_affected(), "Device-queue flushed");
        Ok(())
    }

    /// The maximum class-B emission slot over the device's queue items, used
    /// to pick a non-colliding slot for new items. Zero when no item carries
    /// a slot.
    pub async fn get_max_emit_at_time_since_gps_epoch_for_dev_eui(
        &self,
        dev_eui: Eui64,
    ) -> Result<Duration> {
        let row: (Option<i64>,) = sqlx::query_as(
            "select max(emit_at_time_since_gps_epoch) from device_queue where dev_eui = $1",
        )
        .bind(dev_eui.to_vec())
        .fetch_one(self.pg())
        .await?;

        Ok(Duration::from_millis(row.0.unwrap_or(0).max(0) as u64))
    }

    /// The next item to emit for a device: the head in ascending
    /// frame-counter order. Fails with not-found when the head is pending
    /// with a timeout in the future (the device is awaiting an ack).
    pub async fn get_next_device_queue_item_for_dev_eui(
        &self,
        dev_eui: Eui64,
    ) -> Result<DeviceQueueItem> {
        let qi = sqlx::query_as::<_, DeviceQueueItem>(
            "select * from device_queue where dev_eui = $1 order by f_cnt limit 1",
        )
        .bind(dev_eui.to_vec())
        .fetch_optional(self.pg())
        .await?
        .ok_or(StorageError::NotFound)?;

        if qi.is_pending {
            if let Some(timeout_after) = qi.timeout_after {
                if timeout_after > Utc::now() {
                    return Err(StorageError::NotFound);
                }
            }
        }

        Ok(qi)
    }

    /// The scheduling primitive: the next suitable item for a device given
    /// the maximum payload size for the downlink data-rate and the expected
    /// network frame-counter.
    ///
    /// Unsuitable head items are discarded inside one transaction and the
    /// application server identified by `routing_profile_id` is notified
    /// about each discard after the transaction commits, in production
    /// order:
    /// - a pending head whose timeout passed yields a negative
    ///   `HandleDownlinkACK` (at most one per call, always first),
    /// - a head with a stale frame-counter or an oversized payload yields a
    ///   `HandleError`.
    ///
    /// When the commit fails no notification is delivered; duplicate NACKs
    /// would corrupt application-layer retry logic, so delivery is
    /// at-most-once. Notification failures are logged and not retried.
    pub async fn get_next_device_queue_item_for_dev_eui_max_payload_size_and_f_cnt(
        &self,
        dev_eui: Eui64,
        max_payload_size: usize,
        f_cnt: u32,
        routing_profile_id: Uuid,
    ) -> Result<DeviceQueueItem> {
        let mut tx = self.begin().await?;
        let mut notifications: Vec<AsNotification> = Vec::new();

        let result = loop {
            let head = sqlx::query_as::<_, DeviceQueueItem>(
                "select * from device_queue where dev_eui = $1 order by f_cnt limit 1",
            )
            .bind(dev_eui.to_vec())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(qi) = head else {
                break Err(StorageError::NotFound);
            };

            if qi.is_pending {
                match qi.timeout_after {
                    Some(timeout_after) if timeout_after <= Utc::now() => {
                        // the device did not acknowledge in time
                        sqlx::query("delete from device_queue where id = $1")
                            .bind(qi.id)
                            .execute(&mut *tx)
                            .await?;
                        notifications.push(AsNotification::Nack { f_cnt: qi.f_cnt });
                        continue;
                    }
                    // still awaiting the acknowledgement
                    _ => break Err(StorageError::NotFound),
                }
            }

            if qi.f_cnt < f_cnt {
                sqlx::query("delete from device_queue where id = $1")
                    .bind(qi.id)
                    .execute(&mut *tx)
                    .await?;
                notifications.push(AsNotification::Error {
                    error_type: ErrorType::DeviceQueueItemFcnt,
                    error: "invalid frame-counter".to_string(),
                    f_cnt: qi.f_cnt,
                });
                continue;
            }

            if qi.frm_payload.len() > max_payload_size {
                sqlx::query("delete from device_queue where id = $1")
                    .bind(qi.id)
                    .execute(&mut *tx)
                    .await?;
                notifications.push(AsNotification::Error {
                    error_type: ErrorType::DeviceQueueItemSize,
                    error: "payload exceeds max payload size".to_string(),
                    f_cnt: qi.f_cnt,
                });
                continue;
            }

            break Ok(qi);
        };

        // Discards only count once committed; a failed commit must not leak
        // notifications (at-most-once).
        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(format!("commit error: {e}")))?;

        self.notify_application_server(dev_eui, routing_profile_id, notifications)
            .await;

        result
    }

    /// Up to `count` distinct devices that have a schedulable class-B or
    /// class-C downlink right now.
    ///
    /// The selected device rows are locked with `FOR UPDATE SKIP LOCKED`, so
    /// concurrent dispatcher transactions pick disjoint devices; rolling the
    /// transaction back releases them.
    pub async fn get_devices_with_class_b_or_class_c_device_queue_items(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        count: i64,
    ) -> Result<Vec<Device>> {
        let now = Utc::now();
        let max_emit_ms =
            (gps::time_since_gps_epoch(now) + self.scheduler_interval()).as_millis() as i64;

        Ok(sqlx::query_as::<_, Device>(
            r#"
            select d.*
            from device d
            where exists (
                select 1
                from device_queue dq
                inner join device_profile dp on dp.device_profile_id = d.device_profile_id
                where
                    dq.dev_eui = d.dev_eui
                    and (
                        (dp.supports_class_b and d.mode = 'B' and dq.emit_at_time_since_gps_epoch <= $1)
                        or (dp.supports_class_c and d.mode = 'C')
                    )
            )
            and not exists (
                select 1
                from device_queue dq
                where dq.dev_eui = d.dev_eui and dq.is_pending and dq.timeout_after > $2
            )
            limit $3
            for update of d skip locked
            "#,
        )
        .bind(max_emit_ms)
        .bind(now)
        .bind(count)
        .fetch_all(&mut **tx)
        .await?)
    }

    /// Deliver buffered feedback events to the application server of the
    /// given routing-profile. Best effort: ACK/NACK correctness relies on
    /// the committed queue state, so failures are logged, never retried.
    async fn notify_application_server(
        &self,
        dev_eui: Eui64,
        routing_profile_id: Uuid,
        notifications: Vec<AsNotification>,
    ) {
        if notifications.is_empty() {
            return;
        }

        let rp = match self.get_routing_profile(routing_profile_id).await {
            Ok(rp) => rp,
            Err(e) => {
                error!(routing_profile_id = %routing_profile_id, error = %e, "Get routing-profile error");
                return;
            }
        };

        let pool = match asclient::pool() {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "Get application-server pool error");
                return;
            }
        };

        let client = match pool
            .get(
                &rp.as_id,
                rp.ca_cert.as_bytes(),
                rp.tls_cert.as_bytes(),
                rp.tls_key.as_bytes(),
            )
            .await
        {
            Ok(client) => client,
            Err(e) => {
                error!(server = %rp.as_id, error = %e, "Get application-server client error");
                return;
            }
        };

        for notification in notifications {
            let result = match notification {
                AsNotification::Nack { f_cnt } => {
                    client
                        .handle_downlink_ack(HandleDownlinkAckRequest {
                            dev_eui: dev_eui.to_vec(),
                            f_cnt,
                            acknowledged: false,
                        })
                        .await
                }
                AsNotification::Error {
                    error_type,
                    error,
                    f_cnt,
                } => {
                    client
                        .handle_error(HandleErrorRequest {
                            dev_eui: dev_eui.to_vec(),
                            r#type: error_type as i32,
                            error,
                            f_cnt,
                        })
                        .await
                }
            };

            if let Err(e) = result {
                error!(server = %rp.as_id, dev_eui = %dev_eui, error = %e, "Notify application-server error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_fport_zero() {
        let qi = DeviceQueueItem {
            f_port: 0,
            ..Default::default()
        };
        assert!(matches!(qi.validate(), Err(StorageError::InvalidFPort)));

        let qi = DeviceQueueItem {
            f_port: 1,
            ..Default::default()
        };
        assert!(qi.validate().is_ok());
    }
}
