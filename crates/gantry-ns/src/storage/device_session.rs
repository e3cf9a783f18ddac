//! Device-session storage.
//!
//! A device-session is the per-device security and radio state: addresses,
//! session keys, frame counters, RX parameters, ADR bookkeeping and class-B
//! state. Sessions live in Redis under a TTL and are written through atomic
//! pipelines; the reverse index from DevAddr to device EUIs is a plain set
//! that may contain stale members and is filtered at read time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gantry_lorawan::band::{Channel, MAX_FCNT_GAP, STANDARD_UPLINK_CHANNELS};
use gantry_lorawan::phy::PhyPayload;
use gantry_lorawan::{Aes128Key, DevAddr, Eui64, MacVersion};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::codec::{
    decode_device_gateway_rx_info_set, decode_device_session, encode_device_gateway_rx_info_set,
    encode_device_session,
};
use super::db::Storage;
use super::device_profile::DeviceProfile;
use crate::error::{Result, StorageError};

/// Number of uplink transmissions tracked per session for ADR.
pub const UPLINK_HISTORY_SIZE: usize = 20;

fn device_session_key(dev_eui: Eui64) -> String {
    format!("lora:ns:device:{dev_eui}")
}

fn dev_addr_key(dev_addr: DevAddr) -> String {
    format!("lora:ns:devaddr:{dev_addr}")
}

fn device_gateway_rx_info_set_key(dev_eui: Eui64) -> String {
    format!("lora:ns:device:{dev_eui}:gwrx")
}

/// RX window used for the next downlink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxWindow {
    #[default]
    Rx1 = 0,
    Rx2 = 1,
}

/// Meta-data of one uplink transmission, kept for ADR decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UplinkHistory {
    pub f_cnt: u32,
    pub max_snr: f64,
    pub tx_power_index: i32,
    pub gateway_count: i32,
}

/// A wrapped application session-key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub kek_label: String,
    pub aes_key: Vec<u8>,
}

/// Meta-data of a gateway that received the last uplink of a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceGatewayRxInfo {
    pub gateway_id: Eui64,
    pub rssi: i32,
    pub lora_snr: f64,
    pub antenna: u32,
    pub board: u32,
    /// Opaque gateway context, echoed back on downlink.
    pub context: Vec<u8>,
}

/// The rx-info set of the gateways receiving the last uplink. Overwritten on
/// every uplink; expires together with the device-session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceGatewayRxInfoSet {
    pub dev_eui: Eui64,
    pub dr: u8,
    pub items: Vec<DeviceGatewayRxInfo>,
}

/// A device-session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSession {
    /// MAC version tag ("1.0.x" or "1.1.x").
    pub mac_version: String,

    pub device_profile_id: Uuid,
    pub service_profile_id: Uuid,
    pub routing_profile_id: Uuid,

    pub dev_addr: DevAddr,
    pub dev_eui: Eui64,
    pub join_eui: Eui64,
    pub f_nwk_s_int_key: Aes128Key,
    pub s_nwk_s_int_key: Aes128Key,
    pub nwk_s_enc_key: Aes128Key,
    pub app_s_key_envelope: Option<KeyEnvelope>,

    pub f_cnt_up: u32,
    pub n_f_cnt_down: u32,
    pub a_f_cnt_down: u32,
    pub conf_f_cnt: u32,

    /// Trust the uplink frame-counter instead of validating it. Insecure;
    /// only used by ABP activations that can not persist counters.
    pub skip_f_cnt_validation: bool,

    pub rx_window: RxWindow,
    pub rx_delay: u8,
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx2_frequency: u32,

    /// TX power index the device is using, controlled by the ADR engine.
    pub tx_power_index: i32,

    /// Last known data-rate of the device, controlled by the ADR engine.
    pub dr: i32,

    pub adr: bool,
    pub min_supported_tx_power_index: i32,
    pub max_supported_tx_power_index: i32,

    /// Number of transmissions per unconfirmed uplink; 0 means default.
    pub nb_trans: u8,

    pub enabled_uplink_channels: Vec<u32>,
    pub extra_uplink_channels: BTreeMap<u32, Channel>,
    pub channel_frequencies: Vec<u32>,
    pub uplink_history: Vec<UplinkHistory>,

    pub last_device_status_requested: Option<DateTime<Utc>>,
    pub last_downlink_tx: Option<DateTime<Utc>>,

    pub beacon_locked: bool,
    pub ping_slot_nb: u32,
    pub ping_slot_dr: u8,
    pub ping_slot_frequency: u32,

    pub rejoin_request_enabled: bool,
    pub rejoin_request_max_count_n: u8,
    pub rejoin_request_max_time_n: u8,
    pub rejoin_count_0: u16,

    /// Session to swap in atomically when the pending rejoin completes.
    pub pending_rejoin_device_session: Option<Box<DeviceSession>>,

    /// Reference altitude used for geolocation.
    pub reference_altitude: f64,

    pub uplink_dwell_time_400ms: bool,
    pub downlink_dwell_time_400ms: bool,
    pub uplink_max_eirp_index: u8,
}

impl DeviceSession {
    /// Append an uplink to the ADR history, keeping at most
    /// [`UPLINK_HISTORY_SIZE`] records. A record with the same frame-counter
    /// as the last one is ignored: a re-transmission could as well be a
    /// replay.
    pub fn append_uplink_history(&mut self, up: UplinkHistory) {
        if let Some(last) = self.uplink_history.last() {
            if last.f_cnt == up.f_cnt {
                return;
            }
        }

        self.uplink_history.push(up);
        if self.uplink_history.len() > UPLINK_HISTORY_SIZE {
            let excess = self.uplink_history.len() - UPLINK_HISTORY_SIZE;
            self.uplink_history.drain(..excess);
        }
    }

    /// Packet-loss percentage over the uplink history. Returns 0 until the
    /// history is full, so that an early lost frame does not report e.g. 33%.
    pub fn get_packet_loss_percentage(&self) -> f64 {
        if self.uplink_history.len() < UPLINK_HISTORY_SIZE {
            return 0.0;
        }

        let mut lost_packets: u32 = 0;
        let mut previous_f_cnt: u32 = 0;

        for (i, uh) in self.uplink_history.iter().enumerate() {
            if i == 0 {
                previous_f_cnt = uh.f_cnt;
                continue;
            }
            // there is always an expected difference of 1
            lost_packets += uh.f_cnt - previous_f_cnt - 1;
            previous_f_cnt = uh.f_cnt;
        }

        f64::from(lost_packets) / self.uplink_history.len() as f64 * 100.0
    }

    /// The LoRaWAN MAC version of this session.
    pub fn mac_version(&self) -> MacVersion {
        if self.mac_version.starts_with("1.1") {
            MacVersion::Lorawan1_1
        } else {
            MacVersion::Lorawan1_0
        }
    }

    /// Reset the session to the boot parameters of the given device-profile.
    /// Only meaningful for ABP devices; a no-op when the profile supports
    /// OTAA (the join flow builds a fresh session instead).
    pub fn reset_to_boot_parameters(&mut self, dp: &DeviceProfile) {
        if dp.supports_join {
            return;
        }

        self.tx_power_index = 0;
        self.min_supported_tx_power_index = 0;
        self.max_supported_tx_power_index = 0;
        self.extra_uplink_channels = BTreeMap::new();
        self.rx_delay = dp.rx_delay_1 as u8;
        self.rx1_dr_offset = dp.rx_dr_offset_1 as u8;
        self.rx2_dr = dp.rx_datarate_2 as u8;
        self.rx2_frequency = dp.rx_freq_2 as u32;
        self.enabled_uplink_channels = STANDARD_UPLINK_CHANNELS.to_vec();
        self.channel_frequencies = dp.factory_preset_freqs.iter().map(|f| *f as u32).collect();
        self.ping_slot_dr = dp.ping_slot_dr as u8;
        self.ping_slot_frequency = dp.ping_slot_freq as u32;
        self.nb_trans = 1;

        if dp.ping_slot_period != 0 {
            self.ping_slot_nb = (4096 / dp.ping_slot_period) as u32;
        }
    }
}

/// Validate the received (16 LSB) uplink frame-counter against the session
/// and return the full 32-bit counter. The gap is computed with unsigned
/// 16-bit wrapping subtraction, so a counter rollover yields the positive
/// distance.
pub fn validate_and_get_full_f_cnt_up(s: &DeviceSession, f_cnt_up: u32) -> Option<u32> {
    let gap = u32::from((f_cnt_up as u16).wrapping_sub(s.f_cnt_up as u16));
    if gap < MAX_FCNT_GAP {
        return Some(s.f_cnt_up.wrapping_add(gap));
    }
    None
}

impl Storage {
    /// Save the device-session, creating it when it does not exist yet.
    ///
    /// The session blob, the devaddr set membership and the set expiry are
    /// written in one atomic pipeline; when a pending rejoin session is set,
    /// its devaddr set is updated in the same pipeline.
    ///
    /// The store provides no compare-and-set, so concurrent writers are
    /// last-writer-wins. Simultaneous uplinks for one device are already
    /// deduplicated upstream within a short window keyed on MIC.
    pub async fn save_device_session(&self, s: &DeviceSession) -> Result<()> {
        let blob = encode_device_session(s)?;
        let ttl_ms = self.session_ttl().as_millis() as u64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("PSETEX")
            .arg(device_session_key(s.dev_eui))
            .arg(ttl_ms)
            .arg(blob)
            .ignore()
            .cmd("SADD")
            .arg(dev_addr_key(s.dev_addr))
            .arg(s.dev_eui.to_vec())
            .ignore()
            .cmd("PEXPIRE")
            .arg(dev_addr_key(s.dev_addr))
            .arg(ttl_ms)
            .ignore();

        if let Some(pending) = &s.pending_rejoin_device_session {
            pipe.cmd("SADD")
                .arg(dev_addr_key(pending.dev_addr))
                .arg(s.dev_eui.to_vec())
                .ignore()
                .cmd("PEXPIRE")
                .arg(dev_addr_key(pending.dev_addr))
                .arg(ttl_ms)
                .ignore();
        }

        let mut conn = self.redis();
        let _: () = pipe.query_async(&mut conn).await?;

        info!(dev_eui = %s.dev_eui, dev_addr = %s.dev_addr, "Device-session saved");
        Ok(())
    }

    /// Get the device-session for the given device EUI.
    pub async fn get_device_session(&self, dev_eui: Eui64) -> Result<DeviceSession> {
        let mut conn = self.redis();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(device_session_key(dev_eui))
            .query_async(&mut conn)
            .await?;

        let blob = value.ok_or(StorageError::NotFound)?;
        decode_device_session(&blob)
    }

    /// Delete the device-session matching the given device EUI.
    pub async fn delete_device_session(&self, dev_eui: Eui64) -> Result<()> {
        let mut conn = self.redis();
        let deleted: i64 = redis::cmd("DEL")
            .arg(device_session_key(dev_eui))
            .query_async(&mut conn)
            .await?;
        if deleted == 0 {
            return Err(StorageError::NotFound);
        }

        info!(dev_eui = %dev_eui, "Device-session deleted");
        Ok(())
    }

    /// Whether a device-session exists for the given device EUI, without
    /// reading the blob.
    pub async fn device_session_exists(&self, dev_eui: Eui64) -> Result<bool> {
        let mut conn = self.redis();
        let n: i64 = redis::cmd("EXISTS")
            .arg(device_session_key(dev_eui))
            .query_async(&mut conn)
            .await?;
        Ok(n == 1)
    }

    /// Get all device-sessions using the given DevAddr.
    ///
    /// The devaddr set is a membership view, never authoritative: a member
    /// may have been rekeyed to a different address, or its session may have
    /// expired. Such members are logged and skipped. When a session's
    /// pending rejoin session uses the address, that pending session is
    /// returned as a candidate of its own.
    pub async fn get_device_sessions_for_dev_addr(
        &self,
        dev_addr: DevAddr,
    ) -> Result<Vec<DeviceSession>> {
        let mut conn = self.redis();
        let members: Vec<Vec<u8>> = redis::cmd("SMEMBERS")
            .arg(dev_addr_key(dev_addr))
            .query_async(&mut conn)
            .await?;

        let mut items = Vec::new();
        for member in members {
            let dev_eui = match Eui64::from_slice(&member) {
                Ok(eui) => eui,
                Err(e) => {
                    warn!(dev_addr = %dev_addr, error = %e, "Invalid member in devaddr set");
                    continue;
                }
            };

            let s = match self.get_device_session(dev_eui).await {
                Ok(s) => s,
                Err(StorageError::NotFound) => {
                    warn!(dev_addr = %dev_addr, dev_eui = %dev_eui, "Device-session for devaddr set member does not exist");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // The session may map to a different devaddr when its pending
            // rejoin session owns the address used for the lookup.
            if let Some(pending) = &s.pending_rejoin_device_session {
                if pending.dev_addr == dev_addr {
                    items.push(pending.as_ref().clone());
                }
            }

            if s.dev_addr == dev_addr {
                items.push(s);
            }
        }

        Ok(items)
    }

    /// Resolve the device-session matching the given PHY payload.
    ///
    /// Fetches all sessions associated with the frame's DevAddr and decides
    /// by frame-counter and MIC which one it belongs to.
    ///
    /// When a candidate has `skip_f_cnt_validation` set and the counter gap
    /// check fails, the uplink counter is trusted: the session counter is
    /// reset to the frame value and the uplink history is cleared. If the
    /// MIC validates under the reset counter, the reset session is persisted
    /// before it is returned. This is the one lookup that writes.
    pub async fn get_device_session_for_phy_payload(
        &self,
        phy: &PhyPayload,
        tx_dr: u8,
        tx_ch: u8,
    ) -> Result<DeviceSession> {
        let dev_addr = phy.mac_payload.fhdr.dev_addr;
        let original_f_cnt = phy.mac_payload.fhdr.f_cnt;

        for mut s in self.get_device_sessions_for_dev_addr(dev_addr).await? {
            let mut frame = phy.clone();

            match validate_and_get_full_f_cnt_up(&s, original_f_cnt) {
                Some(full_f_cnt) => {
                    frame.mac_payload.fhdr.f_cnt = full_f_cnt;
                    let mic_ok = frame.validate_uplink_data_mic(
                        s.mac_version(),
                        s.conf_f_cnt,
                        tx_dr,
                        tx_ch,
                        s.f_nwk_s_int_key,
                        s.s_nwk_s_int_key,
                    )?;
                    if mic_ok {
                        return Ok(s);
                    }
                }
                None if s.skip_f_cnt_validation => {
                    // Trust the uplink frame-counter. The downlink counters
                    // are kept: resetting them on a re-transmit would replay
                    // downlink nonces.
                    s.f_cnt_up = original_f_cnt;
                    s.uplink_history = Vec::new();

                    // The ConfFCnt can always be passed; the validation only
                    // uses it when the ACK bit is set.
                    let mic_ok = frame.validate_uplink_data_mic(
                        s.mac_version(),
                        s.conf_f_cnt,
                        tx_dr,
                        tx_ch,
                        s.f_nwk_s_int_key,
                        s.s_nwk_s_int_key,
                    )?;
                    if mic_ok {
                        self.save_device_session(&s).await?;
                        warn!(dev_addr = %dev_addr, dev_eui = %s.dev_eui, "Frame-counters reset");
                        return Ok(s);
                    }
                }
                None => {}
            }
        }

        Err(StorageError::InvalidMic)
    }

    /// Save the gateway rx-info set of the last uplink of a device.
    pub async fn save_device_gateway_rx_info_set(
        &self,
        rx_info_set: &DeviceGatewayRxInfoSet,
    ) -> Result<()> {
        let blob = encode_device_gateway_rx_info_set(rx_info_set);
        let ttl_ms = self.session_ttl().as_millis() as u64;

        let mut conn = self.redis();
        let _: () = redis::cmd("PSETEX")
            .arg(device_gateway_rx_info_set_key(rx_info_set.dev_eui))
            .arg(ttl_ms)
            .arg(blob)
            .query_async(&mut conn)
            .await?;

        info!(dev_eui = %rx_info_set.dev_eui, "Device gateway rx-info meta-data saved");
        Ok(())
    }

    /// Get the gateway rx-info set for the given device EUI.
    pub async fn get_device_gateway_rx_info_set(
        &self,
        dev_eui: Eui64,
    ) -> Result<DeviceGatewayRxInfoSet> {
        let mut conn = self.redis();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(device_gateway_rx_info_set_key(dev_eui))
            .query_async(&mut conn)
            .await?;

        let blob = value.ok_or(StorageError::NotFound)?;
        decode_device_gateway_rx_info_set(&blob)
    }

    /// Delete the gateway rx-info set for the given device EUI.
    pub async fn delete_device_gateway_rx_info_set(&self, dev_eui: Eui64) -> Result<()> {
        let mut conn = self.redis();
        let deleted: i64 = redis::cmd("DEL")
            .arg(device_gateway_rx_info_set_key(dev_eui))
            .query_async(&mut conn)
            .await?;
        if deleted == 0 {
            return Err(StorageError::NotFound);
        }

        info!(dev_eui = %dev_eui, "Device gateway rx-info meta-data deleted");
        Ok(())
    }

    /// Get the gateway rx-info sets for the given device EUIs in one
    /// round-trip. Missing and undecodable entries are skipped.
    pub async fn get_device_gateway_rx_info_set_for_dev_euis(
        &self,
        dev_euis: &[Eui64],
    ) -> Result<Vec<DeviceGatewayRxInfoSet>> {
        if dev_euis.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = dev_euis
            .iter()
            .map(|eui| device_gateway_rx_info_set_key(*eui))
            .collect();

        let mut conn = self.redis();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::new();
        for value in values.into_iter().flatten() {
            match decode_device_gateway_rx_info_set(&value) {
                Ok(set) => out.push(set),
                Err(e) => error!(error = %e, "Decode device gateway rx-info set error"),
            }
        }

        Ok(out)
    }
}
