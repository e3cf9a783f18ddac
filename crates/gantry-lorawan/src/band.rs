//! Regional band constants and channel definitions.
//!
//! Only the band parameters the network-server core depends on are modelled
//! here; full regional channel plans live with the radio front-end.

use serde::{Deserialize, Serialize};

/// Maximum gap between the session frame-counter and a received uplink
/// frame-counter for the uplink to be accepted (band default).
pub const MAX_FCNT_GAP: u32 = 16_384;

/// Indices of the three mandatory uplink channels every device supports.
pub const STANDARD_UPLINK_CHANNELS: [u32; 3] = [0, 1, 2];

/// An uplink channel definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel frequency in Hz.
    pub frequency: u32,
    /// Minimum data-rate usable on this channel.
    pub min_dr: u8,
    /// Maximum data-rate usable on this channel.
    pub max_dr: u8,
}
