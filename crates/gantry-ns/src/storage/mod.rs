//! Storage layer of the network-server core.
//!
//! Device-sessions and gateway rx-info live in Redis (TTL-bound, written
//! through atomic pipelines); devices, profiles and the downlink device
//! queue live in PostgreSQL.

mod codec;
mod db;
mod device;
mod device_profile;
mod device_queue;
mod device_session;
mod routing_profile;
mod service_profile;

pub use codec::{
    decode_device_gateway_rx_info_set, decode_device_session, encode_device_gateway_rx_info_set,
    encode_device_session, DeviceSessionOld,
};
pub use db::Storage;
pub use device::{Device, DeviceMode};
pub use device_profile::DeviceProfile;
pub use device_queue::DeviceQueueItem;
pub use device_session::{
    validate_and_get_full_f_cnt_up, DeviceGatewayRxInfo, DeviceGatewayRxInfoSet, DeviceSession,
    KeyEnvelope, RxWindow, UplinkHistory, UPLINK_HISTORY_SIZE,
};
pub use routing_profile::RoutingProfile;
pub use service_profile::ServiceProfile;
