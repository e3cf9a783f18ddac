//! LoRaWAN air-interface primitives for the Gantry network server.
//!
//! This crate contains the pieces of the LoRaWAN specification the network
//! server core consumes as a library:
//! - fixed-size identifiers and session keys (`Eui64`, `DevAddr`, `NetId`,
//!   `Aes128Key`)
//! - the uplink PHY frame model and its message integrity code (MIC) for
//!   LoRaWAN 1.0 and 1.1
//! - GPS-epoch time conversion used by class-B ping-slot scheduling
//! - regional band constants relevant to frame-counter validation

pub mod band;
pub mod gps;
pub mod phy;

mod error;
mod types;

pub use error::LorawanError;
pub use types::{Aes128Key, DevAddr, Eui64, MacVersion, NetId};
