//! Fixed-size LoRaWAN identifiers and keys.
//!
//! All types render as lowercase hex and (de)serialize as hex strings, which
//! is also the representation used in store keys and structured log fields.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LorawanError;

macro_rules! fixed_bytes_type {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Byte length of this type on the wire.
            pub const LEN: usize = $len;

            /// Construct from a byte slice; the slice must be length-exact.
            pub fn from_slice(b: &[u8]) -> Result<Self, LorawanError> {
                if b.len() != $len {
                    return Err(LorawanError::InvalidLength {
                        expected: $len,
                        got: b.len(),
                    });
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(b);
                Ok(Self(out))
            }

            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = LorawanError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let b = hex::decode(s)?;
                Self::from_slice(&b)
            }
        }

        impl TryFrom<Vec<u8>> for $name {
            type Error = LorawanError;

            fn try_from(b: Vec<u8>) -> Result<Self, Self::Error> {
                Self::from_slice(&b)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

fixed_bytes_type!(Eui64, 8, "64-bit extended unique identifier (device, join-server or gateway).");
fixed_bytes_type!(DevAddr, 4, "32-bit device network address. Not unique across devices.");
fixed_bytes_type!(NetId, 3, "24-bit network identifier.");
fixed_bytes_type!(Aes128Key, 16, "128-bit AES session key.");

impl NetId {
    /// The 7-bit NwkID portion of the NetID.
    pub fn nwk_id(&self) -> u8 {
        self.0[2] & 0x7f
    }
}

impl DevAddr {
    /// Generate a random DevAddr carrying the NwkID prefix of the given NetID.
    pub fn random(net_id: NetId) -> Self {
        use rand::RngCore;

        let mut b = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut b);
        let mut addr = DevAddr(b);
        addr.set_addr_prefix(net_id);
        addr
    }

    /// Set the 7-bit NwkID prefix, keeping the NwkAddr bits.
    pub fn set_addr_prefix(&mut self, net_id: NetId) {
        self.0[0] = (net_id.nwk_id() << 1) | (self.0[0] & 0x01);
    }

    /// NwkID prefix carried by this address.
    pub fn nwk_id(&self) -> u8 {
        self.0[0] >> 1
    }
}

/// LoRaWAN MAC version relevant to MIC calculation and key usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacVersion {
    Lorawan1_0,
    Lorawan1_1,
}
