//! Gantry Protocol Buffers
//!
//! Generated protobuf code for the Gantry wire formats and gRPC APIs:
//! - `DeviceSessionPb`, the versioned on-wire device-session format
//! - `DeviceGatewayRxInfoSetPb`, the last-uplink gateway meta-data
//! - `ApplicationServer`, the AS feedback service (errors, downlink ACKs)

/// Gantry v1 API definitions.
///
/// All generated types and services are included here.
#[allow(
    clippy::derive_partial_eq_without_eq,
    clippy::pedantic,
    clippy::nursery
)]
pub mod v1 {
    tonic::include_proto!("gantry.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

// Re-export prost_types for downstream crates that need Struct/Value conversion
pub use prost_types;
