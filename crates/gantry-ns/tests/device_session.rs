//! Device-session store integration tests.
//!
//! Exercise the Redis-backed session store: save/get/delete, the devaddr
//! membership view, PHY-payload disambiguation by MIC and the frame-counter
//! reset side effect. See `common` for the required environment.

mod common;

use gantry_lorawan::phy::{FCtrl, Fhdr, MacPayload, Mhdr, MType, PhyPayload};
use gantry_lorawan::{Aes128Key, DevAddr, Eui64, MacVersion};
use gantry_ns::error::StorageError;
use gantry_ns::storage::{
    DeviceGatewayRxInfo, DeviceGatewayRxInfoSet, DeviceSession, Storage,
};

use common::test_storage;

fn session(dev_eui: Eui64, dev_addr: DevAddr) -> DeviceSession {
    DeviceSession {
        mac_version: "1.0.2".to_string(),
        dev_eui,
        dev_addr,
        f_nwk_s_int_key: Aes128Key([dev_eui.0[7]; 16]),
        s_nwk_s_int_key: Aes128Key([dev_eui.0[7]; 16]),
        nwk_s_enc_key: Aes128Key([dev_eui.0[7]; 16]),
        f_cnt_up: 8,
        ..Default::default()
    }
}

fn uplink_for_session(s: &DeviceSession, f_cnt: u32) -> PhyPayload {
    let mut phy = PhyPayload {
        mhdr: Mhdr {
            mtype: MType::UnconfirmedDataUp,
            major: 0,
        },
        mac_payload: MacPayload {
            fhdr: Fhdr {
                dev_addr: s.dev_addr,
                f_ctrl: FCtrl::default(),
                f_cnt,
                f_opts: vec![],
            },
            f_port: Some(1),
            frm_payload: vec![1, 2, 3, 4],
        },
        mic: [0; 4],
    };
    phy.set_uplink_data_mic(
        MacVersion::Lorawan1_0,
        0,
        0,
        0,
        s.f_nwk_s_int_key,
        s.s_nwk_s_int_key,
    )
    .unwrap();
    phy
}

async fn clear_session(storage: &Storage, dev_eui: Eui64) {
    // leftovers from previous runs; a missing key is fine
    let _ = storage.delete_device_session(dev_eui).await;
    let _ = storage.delete_device_gateway_rx_info_set(dev_eui).await;
}

// =========================================================================
// save / get / delete / exists
// =========================================================================

#[tokio::test]
async fn save_get_delete_roundtrip() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_eui = Eui64([0x10, 0, 0, 0, 0, 0, 0, 1]);
    clear_session(&storage, dev_eui).await;

    assert!(matches!(
        storage.get_device_session(dev_eui).await,
        Err(StorageError::NotFound)
    ));
    assert!(!storage.device_session_exists(dev_eui).await.unwrap());

    let s = session(dev_eui, DevAddr([0x10, 1, 1, 1]));
    storage.save_device_session(&s).await.unwrap();

    let fetched = storage.get_device_session(dev_eui).await.unwrap();
    assert_eq!(fetched, s);
    assert!(storage.device_session_exists(dev_eui).await.unwrap());

    storage.delete_device_session(dev_eui).await.unwrap();
    assert!(matches!(
        storage.delete_device_session(dev_eui).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn save_embeds_pending_rejoin_session() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_eui = Eui64([0x11, 0, 0, 0, 0, 0, 0, 1]);
    clear_session(&storage, dev_eui).await;

    let mut pending = session(dev_eui, DevAddr([0x11, 2, 2, 2]));
    pending.f_cnt_up = 0;

    let mut s = session(dev_eui, DevAddr([0x11, 1, 1, 1]));
    s.pending_rejoin_device_session = Some(Box::new(pending));
    storage.save_device_session(&s).await.unwrap();

    let fetched = storage.get_device_session(dev_eui).await.unwrap();
    assert_eq!(fetched, s);

    // the pending session's address resolves to this device too
    let candidates = storage
        .get_device_sessions_for_dev_addr(DevAddr([0x11, 2, 2, 2]))
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].dev_addr, DevAddr([0x11, 2, 2, 2]));
    assert_eq!(candidates[0].f_cnt_up, 0);
}

// =========================================================================
// devaddr membership view
// =========================================================================

#[tokio::test]
async fn dev_addr_lookup_returns_all_sharing_sessions() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_addr = DevAddr([0x12, 1, 1, 1]);
    let dev_eui_1 = Eui64([0x12, 0, 0, 0, 0, 0, 0, 1]);
    let dev_eui_2 = Eui64([0x12, 0, 0, 0, 0, 0, 0, 2]);
    clear_session(&storage, dev_eui_1).await;
    clear_session(&storage, dev_eui_2).await;

    storage
        .save_device_session(&session(dev_eui_1, dev_addr))
        .await
        .unwrap();
    storage
        .save_device_session(&session(dev_eui_2, dev_addr))
        .await
        .unwrap();

    let mut euis: Vec<Eui64> = storage
        .get_device_sessions_for_dev_addr(dev_addr)
        .await
        .unwrap()
        .iter()
        .map(|s| s.dev_eui)
        .collect();
    euis.sort();
    assert_eq!(euis, vec![dev_eui_1, dev_eui_2]);
}

#[tokio::test]
async fn dev_addr_lookup_tolerates_stale_members() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let old_addr = DevAddr([0x13, 1, 1, 1]);
    let new_addr = DevAddr([0x13, 2, 2, 2]);
    let dev_eui = Eui64([0x13, 0, 0, 0, 0, 0, 0, 1]);
    clear_session(&storage, dev_eui).await;

    // the device is rekeyed to a new address; the old set keeps the member
    storage
        .save_device_session(&session(dev_eui, old_addr))
        .await
        .unwrap();
    storage
        .save_device_session(&session(dev_eui, new_addr))
        .await
        .unwrap();

    let stale = storage
        .get_device_sessions_for_dev_addr(old_addr)
        .await
        .unwrap();
    assert!(stale.is_empty());

    let current = storage
        .get_device_sessions_for_dev_addr(new_addr)
        .await
        .unwrap();
    assert_eq!(current.len(), 1);

    // a member whose session expired entirely is skipped as well
    storage.delete_device_session(dev_eui).await.unwrap();
    let gone = storage
        .get_device_sessions_for_dev_addr(new_addr)
        .await
        .unwrap();
    assert!(gone.is_empty());
}

// =========================================================================
// PHY-payload disambiguation
// =========================================================================

#[tokio::test]
async fn phy_payload_resolves_by_mic() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_addr = DevAddr([0x14, 1, 1, 1]);
    let dev_eui_1 = Eui64([0x14, 0, 0, 0, 0, 0, 0, 1]);
    let dev_eui_2 = Eui64([0x14, 0, 0, 0, 0, 0, 0, 2]);
    clear_session(&storage, dev_eui_1).await;
    clear_session(&storage, dev_eui_2).await;

    // two devices share the address but have different keys
    let s1 = session(dev_eui_1, dev_addr);
    let s2 = session(dev_eui_2, dev_addr);
    storage.save_device_session(&s1).await.unwrap();
    storage.save_device_session(&s2).await.unwrap();

    let phy = uplink_for_session(&s2, 9);
    let resolved = storage
        .get_device_session_for_phy_payload(&phy, 0, 0)
        .await
        .unwrap();
    assert_eq!(resolved.dev_eui, dev_eui_2);
}

#[tokio::test]
async fn phy_payload_with_unknown_keys_is_rejected() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_addr = DevAddr([0x15, 1, 1, 1]);
    let dev_eui = Eui64([0x15, 0, 0, 0, 0, 0, 0, 1]);
    clear_session(&storage, dev_eui).await;

    let s = session(dev_eui, dev_addr);
    storage.save_device_session(&s).await.unwrap();

    let mut intruder = session(dev_eui, dev_addr);
    intruder.f_nwk_s_int_key = Aes128Key([0xaa; 16]);
    intruder.s_nwk_s_int_key = Aes128Key([0xaa; 16]);
    let phy = uplink_for_session(&intruder, 9);

    assert!(matches!(
        storage.get_device_session_for_phy_payload(&phy, 0, 0).await,
        Err(StorageError::InvalidMic)
    ));
}

#[tokio::test]
async fn phy_payload_out_of_gap_is_rejected() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_addr = DevAddr([0x16, 1, 1, 1]);
    let dev_eui = Eui64([0x16, 0, 0, 0, 0, 0, 0, 1]);
    clear_session(&storage, dev_eui).await;

    let mut s = session(dev_eui, dev_addr);
    s.f_cnt_up = 30_000;
    storage.save_device_session(&s).await.unwrap();

    // a frame far behind the session counter, valid MIC or not
    let phy = uplink_for_session(&s, 10);
    assert!(matches!(
        storage.get_device_session_for_phy_payload(&phy, 0, 0).await,
        Err(StorageError::InvalidMic)
    ));
}

#[tokio::test]
async fn phy_payload_skip_f_cnt_resets_and_persists() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_addr = DevAddr([0x17, 1, 1, 1]);
    let dev_eui = Eui64([0x17, 0, 0, 0, 0, 0, 0, 1]);
    clear_session(&storage, dev_eui).await;

    let mut s = session(dev_eui, dev_addr);
    s.skip_f_cnt_validation = true;
    s.f_cnt_up = 30_000;
    s.uplink_history = vec![Default::default(); 5];
    storage.save_device_session(&s).await.unwrap();

    // the device rebooted and restarted its counter at 10
    let phy = uplink_for_session(&s, 10);
    let resolved = storage
        .get_device_session_for_phy_payload(&phy, 0, 0)
        .await
        .unwrap();
    assert_eq!(resolved.f_cnt_up, 10);
    assert!(resolved.uplink_history.is_empty());

    // the reset was persisted as a side effect of the lookup
    let persisted = storage.get_device_session(dev_eui).await.unwrap();
    assert_eq!(persisted.f_cnt_up, 10);
    assert!(persisted.uplink_history.is_empty());
}

// =========================================================================
// gateway rx-info sets
// =========================================================================

#[tokio::test]
async fn gateway_rx_info_set_roundtrip() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_eui = Eui64([0x18, 0, 0, 0, 0, 0, 0, 1]);
    clear_session(&storage, dev_eui).await;

    assert!(matches!(
        storage.get_device_gateway_rx_info_set(dev_eui).await,
        Err(StorageError::NotFound)
    ));

    let set = DeviceGatewayRxInfoSet {
        dev_eui,
        dr: 3,
        items: vec![DeviceGatewayRxInfo {
            gateway_id: Eui64([9, 9, 9, 9, 9, 9, 9, 9]),
            rssi: -110,
            lora_snr: 4.5,
            antenna: 0,
            board: 1,
            context: vec![1, 2, 3],
        }],
    };
    storage.save_device_gateway_rx_info_set(&set).await.unwrap();

    let fetched = storage.get_device_gateway_rx_info_set(dev_eui).await.unwrap();
    assert_eq!(fetched, set);

    storage
        .delete_device_gateway_rx_info_set(dev_eui)
        .await
        .unwrap();
    assert!(matches!(
        storage.delete_device_gateway_rx_info_set(dev_eui).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn gateway_rx_info_sets_multi_get() {
    let Some(storage) = test_storage().await else {
        return;
    };

    let dev_eui_1 = Eui64([0x19, 0, 0, 0, 0, 0, 0, 1]);
    let dev_eui_2 = Eui64([0x19, 0, 0, 0, 0, 0, 0, 2]);
    let missing = Eui64([0x19, 0, 0, 0, 0, 0, 0, 3]);
    clear_session(&storage, dev_eui_1).await;
    clear_session(&storage, dev_eui_2).await;
    clear_session(&storage, missing).await;

    for dev_eui in [dev_eui_1, dev_eui_2] {
        storage
            .save_device_gateway_rx_info_set(&DeviceGatewayRxInfoSet {
                dev_eui,
                dr: 1,
                items: vec![],
            })
            .await
            .unwrap();
    }

    let sets = storage
        .get_device_gateway_rx_info_set_for_dev_euis(&[dev_eui_1, missing, dev_eui_2])
        .await
        .unwrap();
    let mut euis: Vec<Eui64> = sets.iter().map(|set| set.dev_eui).collect();
    euis.sort();
    assert_eq!(euis, vec![dev_eui_1, dev_eui_2]);

    let none = storage
        .get_device_gateway_rx_info_set_for_dev_euis(&[])
        .await
        .unwrap();
    assert!(none.is_empty());
}
