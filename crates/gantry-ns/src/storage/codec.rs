//! Device-session wire codec.
//!
//! Sessions are stored as protobuf (`DeviceSessionPb`, stable field numbers).
//! Decoding also accepts the legacy self-describing JSON document written by
//! pre-protobuf releases: when the protobuf parse fails, the legacy parse is
//! attempted and the record is migrated (single network session-key fanned
//! out to the 1.1 key set, `enabled_channels` renamed to
//! `enabled_uplink_channels`).

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use gantry_lorawan::band::Channel;
use gantry_lorawan::{Aes128Key, DevAddr, Eui64};
use gantry_proto::v1 as proto;
use prost::Message;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::device_session::{
    DeviceGatewayRxInfo, DeviceGatewayRxInfoSet, DeviceSession, KeyEnvelope, RxWindow,
    UplinkHistory,
};
use crate::error::{Result, StorageError};

/// Encode a device-session to its stored representation. Deterministic for
/// a given input (map fields are ordered).
pub fn encode_device_session(s: &DeviceSession) -> Result<Vec<u8>> {
    Ok(device_session_to_pb(s)?.encode_to_vec())
}

/// Decode a stored device-session, falling back to the legacy format.
pub fn decode_device_session(b: &[u8]) -> Result<DeviceSession> {
    match proto::DeviceSessionPb::decode(b) {
        Ok(pb) => device_session_from_pb(&pb),
        Err(_) => {
            let old: DeviceSessionOld = serde_json::from_slice(b).map_err(|e| {
                StorageError::Internal(format!("decode device-session error: {e}"))
            })?;
            Ok(migrate_device_session_old(old))
        }
    }
}

fn device_session_to_pb(d: &DeviceSession) -> Result<proto::DeviceSessionPb> {
    let pending = match &d.pending_rejoin_device_session {
        Some(p) => encode_device_session(p)?,
        None => Vec::new(),
    };

    Ok(proto::DeviceSessionPb {
        mac_version: d.mac_version.clone(),

        device_profile_id: d.device_profile_id.to_string(),
        service_profile_id: d.service_profile_id.to_string(),
        routing_profile_id: d.routing_profile_id.to_string(),

        dev_addr: d.dev_addr.to_vec(),
        dev_eui: d.dev_eui.to_vec(),
        join_eui: d.join_eui.to_vec(),
        f_nwk_s_int_key: d.f_nwk_s_int_key.to_vec(),
        s_nwk_s_int_key: d.s_nwk_s_int_key.to_vec(),
        nwk_s_enc_key: d.nwk_s_enc_key.to_vec(),

        app_s_key_envelope: d.app_s_key_envelope.as_ref().map(|k| proto::KeyEnvelope {
            kek_label: k.kek_label.clone(),
            aes_key: k.aes_key.clone(),
        }),

        f_cnt_up: d.f_cnt_up,
        n_f_cnt_down: d.n_f_cnt_down,
        a_f_cnt_down: d.a_f_cnt_down,
        conf_f_cnt: d.conf_f_cnt,
        skip_f_cnt_check: d.skip_f_cnt_validation,

        rx_window: d.rx_window as u32,
        rx_delay: u32::from(d.rx_delay),
        rx1_dr_offset: u32::from(d.rx1_dr_offset),
        rx2_dr: u32::from(d.rx2_dr),
        rx2_frequency: d.rx2_frequency,

        tx_power_index: d.tx_power_index as u32,
        dr: d.dr as u32,
        adr: d.adr,
        min_supported_tx_power_index: d.min_supported_tx_power_index as u32,
        max_supported_tx_power_index: d.max_supported_tx_power_index as u32,
        nb_trans: u32::from(d.nb_trans),

        enabled_uplink_channels: d.enabled_uplink_channels.clone(),
        extra_uplink_channels: d
            .extra_uplink_channels
            .iter()
            .map(|(i, c)| {
                (
                    *i,
                    proto::DeviceSessionPbChannel {
                        frequency: c.frequency,
                        min_dr: u32::from(c.min_dr),
                        max_dr: u32::from(c.max_dr),
                    },
                )
            })
            .collect(),
        channel_frequencies: d.channel_frequencies.clone(),
        uplink_adr_history: d
            .uplink_history
            .iter()
            .map(|h| proto::DeviceSessionPbUplinkAdrHistory {
                f_cnt: h.f_cnt,
                max_snr: h.max_snr,
                tx_power_index: h.tx_power_index as u32,
                gateway_count: h.gateway_count as u32,
            })
            .collect(),

        last_device_status_request_time_unix_ns: d
            .last_device_status_requested
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(0),
        last_downlink_tx_timestamp_unix_ns: d
            .last_downlink_tx
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(0),

        beacon_locked: d.beacon_locked,
        ping_slot_nb: d.ping_slot_nb,
        ping_slot_dr: u32::from(d.ping_slot_dr),
        ping_slot_frequency: d.ping_slot_frequency,

        rejoin_request_enabled: d.rejoin_request_enabled,
        rejoin_request_max_count_n: u32::from(d.rejoin_request_max_count_n),
        rejoin_request_max_time_n: u32::from(d.rejoin_request_max_time_n),
        rejoin_count_0: u32::from(d.rejoin_count_0),

        pending_rejoin_device_session: pending,

        reference_altitude: d.reference_altitude,

        uplink_dwell_time_400ms: d.uplink_dwell_time_400ms,
        downlink_dwell_time_400ms: d.downlink_dwell_time_400ms,
        uplink_max_eirp_index: u32::from(d.uplink_max_eirp_index),
    })
}

fn device_session_from_pb(d: &proto::DeviceSessionPb) -> Result<DeviceSession> {
    let strict = |name: &str, e: gantry_lorawan::LorawanError| {
        StorageError::Internal(format!("decode device-session {name}: {e}"))
    };

    let mut out = DeviceSession {
        mac_version: d.mac_version.clone(),

        device_profile_id: Uuid::parse_str(&d.device_profile_id).unwrap_or_default(),
        service_profile_id: Uuid::parse_str(&d.service_profile_id).unwrap_or_default(),
        routing_profile_id: Uuid::parse_str(&d.routing_profile_id).unwrap_or_default(),

        dev_addr: DevAddr::from_slice(&d.dev_addr).map_err(|e| strict("dev_addr", e))?,
        dev_eui: Eui64::from_slice(&d.dev_eui).map_err(|e| strict("dev_eui", e))?,
        join_eui: Eui64::from_slice(&d.join_eui).map_err(|e| strict("join_eui", e))?,
        f_nwk_s_int_key: Aes128Key::from_slice(&d.f_nwk_s_int_key)
            .map_err(|e| strict("f_nwk_s_int_key", e))?,
        s_nwk_s_int_key: Aes128Key::from_slice(&d.s_nwk_s_int_key)
            .map_err(|e| strict("s_nwk_s_int_key", e))?,
        nwk_s_enc_key: Aes128Key::from_slice(&d.nwk_s_enc_key)
            .map_err(|e| strict("nwk_s_enc_key", e))?,

        app_s_key_envelope: d.app_s_key_envelope.as_ref().map(|k| KeyEnvelope {
            kek_label: k.kek_label.clone(),
            aes_key: k.aes_key.clone(),
        }),

        f_cnt_up: d.f_cnt_up,
        n_f_cnt_down: d.n_f_cnt_down,
        a_f_cnt_down: d.a_f_cnt_down,
        conf_f_cnt: d.conf_f_cnt,
        skip_f_cnt_validation: d.skip_f_cnt_check,

        rx_window: match d.rx_window {
            1 => RxWindow::Rx2,
            _ => RxWindow::Rx1,
        },
        rx_delay: d.rx_delay as u8,
        rx1_dr_offset: d.rx1_dr_offset as u8,
        rx2_dr: d.rx2_dr as u8,
        rx2_frequency: d.rx2_frequency,

        tx_power_index: d.tx_power_index as i32,
        dr: d.dr as i32,
        adr: d.adr,
        min_supported_tx_power_index: d.min_supported_tx_power_index as i32,
        max_supported_tx_power_index: d.max_supported_tx_power_index as i32,
        nb_trans: d.nb_trans as u8,

        enabled_uplink_channels: d.enabled_uplink_channels.clone(),
        extra_uplink_channels: d
            .extra_uplink_channels
            .iter()
            .map(|(i, c)| {
                (
                    *i,
                    Channel {
                        frequency: c.frequency,
                        min_dr: c.min_dr as u8,
                        max_dr: c.max_dr as u8,
                    },
                )
            })
            .collect(),
        channel_frequencies: d.channel_frequencies.clone(),
        uplink_history: d
            .uplink_adr_history
            .iter()
            .map(|h| UplinkHistory {
                f_cnt: h.f_cnt,
                max_snr: h.max_snr,
                tx_power_index: h.tx_power_index as i32,
                gateway_count: h.gateway_count as i32,
            })
            .collect(),

        last_device_status_requested: (d.last_device_status_request_time_unix_ns > 0)
            .then(|| Utc.timestamp_nanos(d.last_device_status_request_time_unix_ns)),
        last_downlink_tx: (d.last_downlink_tx_timestamp_unix_ns > 0)
            .then(|| Utc.timestamp_nanos(d.last_downlink_tx_timestamp_unix_ns)),

        beacon_locked: d.beacon_locked,
        ping_slot_nb: d.ping_slot_nb,
        ping_slot_dr: d.ping_slot_dr as u8,
        ping_slot_frequency: d.ping_slot_frequency,

        rejoin_request_enabled: d.rejoin_request_enabled,
        rejoin_request_max_count_n: d.rejoin_request_max_count_n as u8,
        rejoin_request_max_time_n: d.rejoin_request_max_time_n as u8,
        rejoin_count_0: d.rejoin_count_0 as u16,

        pending_rejoin_device_session: None,

        reference_altitude: d.reference_altitude,

        uplink_dwell_time_400ms: d.uplink_dwell_time_400ms,
        downlink_dwell_time_400ms: d.downlink_dwell_time_400ms,
        uplink_max_eirp_index: d.uplink_max_eirp_index as u8,
    };

    if !d.pending_rejoin_device_session.is_empty() {
        match proto::DeviceSessionPb::decode(d.pending_rejoin_device_session.as_slice())
            .map_err(|e| StorageError::Internal(e.to_string()))
            .and_then(|pb| device_session_from_pb(&pb))
        {
            Ok(pending) => out.pending_rejoin_device_session = Some(Box::new(pending)),
            Err(e) => {
                error!(dev_eui = %out.dev_eui, error = %e, "Decode pending rejoin device-session error");
            }
        }
    }

    Ok(out)
}

/// The legacy device-session document. Written by releases that predate both
/// the protobuf format and LoRaWAN 1.1 (single network session-key, single
/// downlink frame-counter).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSessionOld {
    pub device_profile_id: Uuid,
    pub service_profile_id: Uuid,
    pub routing_profile_id: Uuid,

    pub dev_addr: DevAddr,
    pub dev_eui: Eui64,
    pub join_eui: Eui64,
    pub nwk_s_key: Aes128Key,

    pub f_cnt_up: u32,
    pub f_cnt_down: u32,
    pub skip_f_cnt_validation: bool,

    pub rx_window: RxWindow,
    pub rx_delay: u8,
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx2_frequency: u32,

    pub tx_power_index: i32,
    pub dr: i32,
    pub adr: bool,
    pub max_supported_tx_power_index: i32,
    pub nb_trans: u8,

    pub enabled_channels: Vec<u32>,
    pub extra_uplink_channels: BTreeMap<u32, Channel>,
    pub channel_frequencies: Vec<u32>,
    pub uplink_history: Vec<UplinkHistory>,

    pub last_dev_status_requested: Option<DateTime<Utc>>,

    pub beacon_locked: bool,
    pub ping_slot_nb: u32,
    pub ping_slot_dr: u8,
    pub ping_slot_frequency: u32,

    pub reference_altitude: f64,
}

fn migrate_device_session_old(o: DeviceSessionOld) -> DeviceSession {
    DeviceSession {
        // the legacy format predates LoRaWAN 1.1
        mac_version: "1.0.2".to_string(),

        device_profile_id: o.device_profile_id,
        service_profile_id: o.service_profile_id,
        routing_profile_id: o.routing_profile_id,

        dev_addr: o.dev_addr,
        dev_eui: o.dev_eui,
        join_eui: o.join_eui,
        // in 1.0 the three network session-keys collapse to the NwkSKey
        f_nwk_s_int_key: o.nwk_s_key,
        s_nwk_s_int_key: o.nwk_s_key,
        nwk_s_enc_key: o.nwk_s_key,

        f_cnt_up: o.f_cnt_up,
        n_f_cnt_down: o.f_cnt_down,
        skip_f_cnt_validation: o.skip_f_cnt_validation,

        rx_window: o.rx_window,
        rx_delay: o.rx_delay,
        rx1_dr_offset: o.rx1_dr_offset,
        rx2_dr: o.rx2_dr,
        rx2_frequency: o.rx2_frequency,

        tx_power_index: o.tx_power_index,
        dr: o.dr,
        adr: o.adr,
        max_supported_tx_power_index: o.max_supported_tx_power_index,
        nb_trans: o.nb_trans,

        enabled_uplink_channels: o.enabled_channels,
        extra_uplink_channels: o.extra_uplink_channels,
        channel_frequencies: o.channel_frequencies,
        uplink_history: o.uplink_history,

        last_device_status_requested: o.last_dev_status_requested,

        beacon_locked: o.beacon_locked,
        ping_slot_nb: o.ping_slot_nb,
        ping_slot_dr: o.ping_slot_dr,
        ping_slot_frequency: o.ping_slot_frequency,

        reference_altitude: o.reference_altitude,

        ..Default::default()
    }
}

/// Encode a gateway rx-info set to its stored representation.
pub fn encode_device_gateway_rx_info_set(set: &DeviceGatewayRxInfoSet) -> Vec<u8> {
    proto::DeviceGatewayRxInfoSetPb {
        dev_eui: set.dev_eui.to_vec(),
        dr: u32::from(set.dr),
        items: set
            .items
            .iter()
            .map(|item| proto::DeviceGatewayRxInfoPb {
                gateway_id: item.gateway_id.to_vec(),
                rssi: item.rssi,
                lora_snr: item.lora_snr,
                antenna: item.antenna,
                board: item.board,
                context: item.context.clone(),
            })
            .collect(),
    }
    .encode_to_vec()
}

/// Decode a stored gateway rx-info set.
pub fn decode_device_gateway_rx_info_set(b: &[u8]) -> Result<DeviceGatewayRxInfoSet> {
    let pb = proto::DeviceGatewayRxInfoSetPb::decode(b)
        .map_err(|e| StorageError::Internal(format!("decode rx-info set error: {e}")))?;

    let mut items = Vec::with_capacity(pb.items.len());
    for item in &pb.items {
        items.push(DeviceGatewayRxInfo {
            gateway_id: Eui64::from_slice(&item.gateway_id)
                .map_err(|e| StorageError::Internal(format!("decode gateway_id: {e}")))?,
            rssi: item.rssi,
            lora_snr: item.lora_snr,
            antenna: item.antenna,
            board: item.board,
            context: item.context.clone(),
        });
    }

    Ok(DeviceGatewayRxInfoSet {
        dev_eui: Eui64::from_slice(&pb.dev_eui)
            .map_err(|e| StorageError::Internal(format!("decode dev_eui: {e}")))?,
        dr: pb.dr as u8,
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_session() -> DeviceSession {
        DeviceSession {
            mac_version: "1.1.0".to_string(),
            device_profile_id: Uuid::new_v4(),
            service_profile_id: Uuid::new_v4(),
            routing_profile_id: Uuid::new_v4(),
            dev_addr: DevAddr([1, 2, 3, 4]),
            dev_eui: Eui64([8, 7, 6, 5, 4, 3, 2, 1]),
            join_eui: Eui64([1, 1, 1, 1, 2, 2, 2, 2]),
            f_nwk_s_int_key: Aes128Key([1; 16]),
            s_nwk_s_int_key: Aes128Key([2; 16]),
            nwk_s_enc_key: Aes128Key([3; 16]),
            app_s_key_envelope: Some(KeyEnvelope {
                kek_label: "kek-1".to_string(),
                aes_key: vec![9; 32],
            }),
            f_cnt_up: 100,
            n_f_cnt_down: 50,
            a_f_cnt_down: 51,
            conf_f_cnt: 7,
            skip_f_cnt_validation: true,
            rx_window: RxWindow::Rx2,
            rx_delay: 1,
            rx1_dr_offset: 2,
            rx2_dr: 3,
            rx2_frequency: 869_525_000,
            tx_power_index: 4,
            dr: 5,
            adr: true,
            min_supported_tx_power_index: 1,
            max_supported_tx_power_index: 6,
            nb_trans: 2,
            enabled_uplink_channels: vec![0, 1, 2, 4],
            extra_uplink_channels: [
                (
                    4,
                    Channel {
                        frequency: 867_100_000,
                        min_dr: 0,
                        max_dr: 5,
                    },
                ),
                (
                    5,
                    Channel {
                        frequency: 867_300_000,
                        min_dr: 0,
                        max_dr: 5,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            channel_frequencies: vec![868_100_000, 868_300_000],
            uplink_history: vec![UplinkHistory {
                f_cnt: 99,
                max_snr: 7.5,
                tx_power_index: 1,
                gateway_count: 3,
            }],
            last_device_status_requested: Some(Utc.timestamp_nanos(1_700_000_000_123_456_789)),
            last_downlink_tx: Some(Utc.timestamp_nanos(1_700_000_001_000_000_000)),
            beacon_locked: true,
            ping_slot_nb: 128,
            ping_slot_dr: 3,
            ping_slot_frequency: 869_525_000,
            rejoin_request_enabled: true,
            rejoin_request_max_count_n: 10,
            rejoin_request_max_time_n: 11,
            rejoin_count_0: 12,
            pending_rejoin_device_session: None,
            reference_altitude: 5.5,
            uplink_dwell_time_400ms: true,
            downlink_dwell_time_400ms: false,
            uplink_max_eirp_index: 13,
        }
    }

    // === protobuf roundtrip ===

    #[test]
    fn encode_decode_roundtrip() {
        let s = full_session();
        let b = encode_device_session(&s).unwrap();
        let decoded = decode_device_session(&b).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn encode_decode_roundtrip_with_pending_rejoin() {
        let mut pending = full_session();
        pending.dev_addr = DevAddr([9, 9, 9, 9]);
        pending.f_cnt_up = 0;

        let mut s = full_session();
        s.pending_rejoin_device_session = Some(Box::new(pending));

        let b = encode_device_session(&s).unwrap();
        let decoded = decode_device_session(&b).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn encode_is_deterministic() {
        let a = encode_device_session(&full_session()).unwrap();
        let b = encode_device_session(&full_session()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decode_is_strict_about_key_length() {
        let mut pb = device_session_to_pb(&full_session()).unwrap();
        pb.f_nwk_s_int_key = vec![1, 2, 3];
        let b = pb.encode_to_vec();
        assert!(matches!(
            decode_device_session(&b),
            Err(StorageError::Internal(_))
        ));
    }

    // === legacy fallback ===

    #[test]
    fn decode_falls_back_to_legacy_format() {
        let old = DeviceSessionOld {
            dev_addr: DevAddr([1, 2, 3, 4]),
            dev_eui: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            nwk_s_key: Aes128Key([8; 16]),
            f_cnt_up: 10,
            f_cnt_down: 11,
            enabled_channels: vec![0, 1, 2],
            ..Default::default()
        };
        let b = serde_json::to_vec(&old).unwrap();

        let s = decode_device_session(&b).unwrap();
        assert_eq!(s.dev_eui, old.dev_eui);
        assert_eq!(s.enabled_uplink_channels, vec![0, 1, 2]);
        assert_eq!(s.f_nwk_s_int_key, old.nwk_s_key);
        assert_eq!(s.s_nwk_s_int_key, old.nwk_s_key);
        assert_eq!(s.nwk_s_enc_key, old.nwk_s_key);
        assert_eq!(s.f_cnt_up, 10);
        assert_eq!(s.n_f_cnt_down, 11);
        assert_eq!(s.mac_version(), gantry_lorawan::MacVersion::Lorawan1_0);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(decode_device_session(b"\x00\x01garbage").is_err());
    }

    // === rx-info set ===

    #[test]
    fn rx_info_set_roundtrip() {
        let set = DeviceGatewayRxInfoSet {
            dev_eui: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            dr: 5,
            items: vec![DeviceGatewayRxInfo {
                gateway_id: Eui64([8, 8, 8, 8, 8, 8, 8, 8]),
                rssi: -120,
                lora_snr: -5.5,
                antenna: 1,
                board: 2,
                context: vec![1, 2, 3, 4],
            }],
        };
        let b = encode_device_gateway_rx_info_set(&set);
        assert_eq!(decode_device_gateway_rx_info_set(&b).unwrap(), set);
    }
}
