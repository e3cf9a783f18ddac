//! Uplink PHY frame model and message integrity code.
//!
//! Models the subset of the LoRaWAN PHY layer the network server needs to
//! resolve a received data uplink to a device-session: the MHDR / FHDR /
//! FPort / FRMPayload layout and the uplink data MIC for both LoRaWAN 1.0
//! (single CMAC over B0) and LoRaWAN 1.1 (truncated two-key CMAC over B0/B1).

use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::LorawanError;
use crate::types::{Aes128Key, DevAddr, MacVersion};

/// Frame type carried in the MHDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedDataUp = 2,
    UnconfirmedDataDown = 3,
    ConfirmedDataUp = 4,
    ConfirmedDataDown = 5,
    RejoinRequest = 6,
    Proprietary = 7,
}

impl TryFrom<u8> for MType {
    type Error = LorawanError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::JoinRequest),
            1 => Ok(Self::JoinAccept),
            2 => Ok(Self::UnconfirmedDataUp),
            3 => Ok(Self::UnconfirmedDataDown),
            4 => Ok(Self::ConfirmedDataUp),
            5 => Ok(Self::ConfirmedDataDown),
            6 => Ok(Self::RejoinRequest),
            7 => Ok(Self::Proprietary),
            other => Err(LorawanError::UnknownMType(other)),
        }
    }
}

/// MAC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    pub mtype: MType,
    pub major: u8,
}

impl Mhdr {
    fn to_byte(self) -> u8 {
        ((self.mtype as u8) << 5) | (self.major & 0x03)
    }

    fn from_byte(b: u8) -> Result<Self, LorawanError> {
        Ok(Self {
            mtype: MType::try_from(b >> 5)?,
            major: b & 0x03,
        })
    }
}

/// Frame control bits of an uplink FHDR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub class_b: bool,
}

impl FCtrl {
    fn to_byte(self, f_opts_len: usize) -> u8 {
        let mut b = (f_opts_len as u8) & 0x0f;
        if self.adr {
            b |= 0x80;
        }
        if self.adr_ack_req {
            b |= 0x40;
        }
        if self.ack {
            b |= 0x20;
        }
        if self.class_b {
            b |= 0x10;
        }
        b
    }

    fn from_byte(b: u8) -> (Self, usize) {
        (
            Self {
                adr: b & 0x80 != 0,
                adr_ack_req: b & 0x40 != 0,
                ack: b & 0x20 != 0,
                class_b: b & 0x10 != 0,
            },
            (b & 0x0f) as usize,
        )
    }
}

/// Frame header of a data frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fhdr {
    pub dev_addr: DevAddr,
    pub f_ctrl: FCtrl,
    /// Full 32-bit frame counter. Only the 16 LSB go on the air; the session
    /// store lifts the received value back to 32 bits before MIC validation.
    pub f_cnt: u32,
    pub f_opts: Vec<u8>,
}

/// MAC payload of a data frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacPayload {
    pub fhdr: Fhdr,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
}

/// A data-carrying PHY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyPayload {
    pub mhdr: Mhdr,
    pub mac_payload: MacPayload,
    pub mic: [u8; 4],
}

impl PhyPayload {
    /// Serialize MHDR | FHDR | FPort | FRMPayload (everything the MIC covers).
    /// The frame carries only the 16 LSB of the frame counter.
    fn marshal_mic_input(&self) -> Result<Vec<u8>, LorawanError> {
        let mac = &self.mac_payload;
        if !mac.frm_payload.is_empty() && mac.f_port.is_none() {
            return Err(LorawanError::MissingFPort);
        }

        let mut out = Vec::with_capacity(12 + mac.fhdr.f_opts.len() + mac.frm_payload.len());
        out.push(self.mhdr.to_byte());

        // FHDR: DevAddr is little-endian on the wire.
        let mut addr = *mac.fhdr.dev_addr.as_bytes();
        addr.reverse();
        out.extend_from_slice(&addr);
        out.push(mac.fhdr.f_ctrl.to_byte(mac.fhdr.f_opts.len()));
        out.extend_from_slice(&(mac.fhdr.f_cnt as u16).to_le_bytes());
        out.extend_from_slice(&mac.fhdr.f_opts);

        if let Some(port) = mac.f_port {
            out.push(port);
            out.extend_from_slice(&mac.frm_payload);
        }

        Ok(out)
    }

    /// Serialize the complete frame, MIC included.
    pub fn to_vec(&self) -> Result<Vec<u8>, LorawanError> {
        let mut out = self.marshal_mic_input()?;
        out.extend_from_slice(&self.mic);
        Ok(out)
    }

    /// Parse a data uplink/downlink frame.
    pub fn from_slice(b: &[u8]) -> Result<Self, LorawanError> {
        // MHDR + DevAddr + FCtrl + FCnt + MIC
        if b.len() < 12 {
            return Err(LorawanError::FrameTooShort(b.len()));
        }

        let mhdr = Mhdr::from_byte(b[0])?;
        let mut addr = [b[1], b[2], b[3], b[4]];
        addr.reverse();
        let (f_ctrl, f_opts_len) = FCtrl::from_byte(b[5]);
        let f_cnt = u32::from(u16::from_le_bytes([b[6], b[7]]));

        let rest = &b[8..b.len() - 4];
        if rest.len() < f_opts_len {
            return Err(LorawanError::FrameTooShort(b.len()));
        }
        let f_opts = rest[..f_opts_len].to_vec();
        let body = &rest[f_opts_len..];
        let (f_port, frm_payload) = match body.split_first() {
            Some((port, payload)) => (Some(*port), payload.to_vec()),
            None => (None, Vec::new()),
        };

        let mut mic = [0u8; 4];
        mic.copy_from_slice(&b[b.len() - 4..]);

        Ok(Self {
            mhdr,
            mac_payload: MacPayload {
                fhdr: Fhdr {
                    dev_addr: DevAddr(addr),
                    f_ctrl,
                    f_cnt,
                    f_opts,
                },
                f_port,
                frm_payload,
            },
            mic,
        })
    }

    /// Compute the uplink data MIC.
    ///
    /// For LoRaWAN 1.0 this is the first four bytes of the B0-keyed CMAC
    /// using `f_nwk_s_int_key`. For LoRaWAN 1.1 the MIC is
    /// `cmacS[0..2] | cmacF[0..2]`, where cmacS is keyed with
    /// `s_nwk_s_int_key` over the B1 block carrying `conf_f_cnt`, the uplink
    /// data rate and channel. `conf_f_cnt` only participates when the frame
    /// acknowledges a confirmed downlink (ACK bit set).
    pub fn compute_uplink_data_mic(
        &self,
        mac_version: MacVersion,
        conf_f_cnt: u32,
        tx_dr: u8,
        tx_ch: u8,
        f_nwk_s_int_key: Aes128Key,
        s_nwk_s_int_key: Aes128Key,
    ) -> Result<[u8; 4], LorawanError> {
        let msg = self.marshal_mic_input()?;
        let fhdr = &self.mac_payload.fhdr;

        let conf_f_cnt = if fhdr.f_ctrl.ack { conf_f_cnt as u16 } else { 0 };

        let cmac_f = block_cmac(
            f_nwk_s_int_key,
            &b0_block(0, 0, 0, fhdr.dev_addr, fhdr.f_cnt, &msg),
            &msg,
        );

        match mac_version {
            MacVersion::Lorawan1_0 => Ok([cmac_f[0], cmac_f[1], cmac_f[2], cmac_f[3]]),
            MacVersion::Lorawan1_1 => {
                let cmac_s = block_cmac(
                    s_nwk_s_int_key,
                    &b0_block(conf_f_cnt, tx_dr, tx_ch, fhdr.dev_addr, fhdr.f_cnt, &msg),
                    &msg,
                );
                Ok([cmac_s[0], cmac_s[1], cmac_f[0], cmac_f[1]])
            }
        }
    }

    /// Compute and set the uplink data MIC.
    pub fn set_uplink_data_mic(
        &mut self,
        mac_version: MacVersion,
        conf_f_cnt: u32,
        tx_dr: u8,
        tx_ch: u8,
        f_nwk_s_int_key: Aes128Key,
        s_nwk_s_int_key: Aes128Key,
    ) -> Result<(), LorawanError> {
        self.mic = self.compute_uplink_data_mic(
            mac_version,
            conf_f_cnt,
            tx_dr,
            tx_ch,
            f_nwk_s_int_key,
            s_nwk_s_int_key,
        )?;
        Ok(())
    }

    /// Validate the uplink data MIC against the session keys.
    pub fn validate_uplink_data_mic(
        &self,
        mac_version: MacVersion,
        conf_f_cnt: u32,
        tx_dr: u8,
        tx_ch: u8,
        f_nwk_s_int_key: Aes128Key,
        s_nwk_s_int_key: Aes128Key,
    ) -> Result<bool, LorawanError> {
        let expected = self.compute_uplink_data_mic(
            mac_version,
            conf_f_cnt,
            tx_dr,
            tx_ch,
            f_nwk_s_int_key,
            s_nwk_s_int_key,
        )?;
        Ok(expected == self.mic)
    }
}

/// The B0/B1 CMAC prefix block. For B0, `conf_f_cnt`, `tx_dr` and `tx_ch`
/// are zero; for B1 (LoRaWAN 1.1 cmacS) they carry the uplink parameters.
fn b0_block(
    conf_f_cnt: u16,
    tx_dr: u8,
    tx_ch: u8,
    dev_addr: DevAddr,
    f_cnt: u32,
    msg: &[u8],
) -> [u8; 16] {
    let mut b = [0u8; 16];
    b[0] = 0x49;
    b[1..3].copy_from_slice(&conf_f_cnt.to_le_bytes());
    b[3] = tx_dr;
    b[4] = tx_ch;
    // b[5]: direction, 0x00 for uplink
    let mut addr = *dev_addr.as_bytes();
    addr.reverse();
    b[6..10].copy_from_slice(&addr);
    b[10..14].copy_from_slice(&f_cnt.to_le_bytes());
    // b[14] is always 0x00
    b[15] = msg.len() as u8;
    b
}

fn block_cmac(key: Aes128Key, block: &[u8; 16], msg: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new_from_slice(key.as_bytes())
        .expect("AES-128 CMAC accepts 16-byte keys");
    mac.update(block);
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink_frame(f_cnt: u32, ack: bool) -> PhyPayload {
        PhyPayload {
            mhdr: Mhdr {
                mtype: MType::UnconfirmedDataUp,
                major: 0,
            },
            mac_payload: MacPayload {
                fhdr: Fhdr {
                    dev_addr: DevAddr([1, 2, 3, 4]),
                    f_ctrl: FCtrl {
                        ack,
                        ..Default::default()
                    },
                    f_cnt,
                    f_opts: vec![],
                },
                f_port: Some(1),
                frm_payload: vec![9, 8, 7],
            },
            mic: [0; 4],
        }
    }

    #[test]
    fn marshal_parse_roundtrip() {
        let mut phy = uplink_frame(10, false);
        phy.mic = [1, 2, 3, 4];
        let b = phy.to_vec().unwrap();
        let parsed = PhyPayload::from_slice(&b).unwrap();
        assert_eq!(parsed.mhdr, phy.mhdr);
        assert_eq!(parsed.mac_payload.fhdr.dev_addr, DevAddr([1, 2, 3, 4]));
        assert_eq!(parsed.mac_payload.fhdr.f_cnt, 10);
        assert_eq!(parsed.mac_payload.f_port, Some(1));
        assert_eq!(parsed.mac_payload.frm_payload, vec![9, 8, 7]);
        assert_eq!(parsed.mic, [1, 2, 3, 4]);
    }

    #[test]
    fn parse_lifts_only_16_bits() {
        let phy = uplink_frame(0x0001_0005, false);
        let b = phy.to_vec().unwrap();
        let parsed = PhyPayload::from_slice(&b).unwrap();
        assert_eq!(parsed.mac_payload.fhdr.f_cnt, 5);
    }

    #[test]
    fn mic_self_consistency_1_0() {
        let fkey = Aes128Key([1; 16]);
        let skey = Aes128Key([2; 16]);
        let mut phy = uplink_frame(42, false);
        phy.set_uplink_data_mic(MacVersion::Lorawan1_0, 0, 0, 0, fkey, skey)
            .unwrap();
        assert!(phy
            .validate_uplink_data_mic(MacVersion::Lorawan1_0, 0, 0, 0, fkey, skey)
            .unwrap());

        // wrong key fails
        assert!(!phy
            .validate_uplink_data_mic(MacVersion::Lorawan1_0, 0, 0, 0, skey, skey)
            .unwrap());
    }

    #[test]
    fn mic_self_consistency_1_1() {
        let fkey = Aes128Key([1; 16]);
        let skey = Aes128Key([2; 16]);
        let mut phy = uplink_frame(42, true);
        phy.set_uplink_data_mic(MacVersion::Lorawan1_1, 7, 5, 2, fkey, skey)
            .unwrap();
        assert!(phy
            .validate_uplink_data_mic(MacVersion::Lorawan1_1, 7, 5, 2, fkey, skey)
            .unwrap());

        // mismatched ConfFCnt fails when the ACK bit is set
        assert!(!phy
            .validate_uplink_data_mic(MacVersion::Lorawan1_1, 8, 5, 2, fkey, skey)
            .unwrap());

        // tampered payload fails
        let mut tampered = phy.clone();
        tampered.mac_payload.frm_payload[0] ^= 0xff;
        assert!(!tampered
            .validate_uplink_data_mic(MacVersion::Lorawan1_1, 7, 5, 2, fkey, skey)
            .unwrap());
    }

    #[test]
    fn mic_changes_with_fcnt() {
        let fkey = Aes128Key([1; 16]);
        let skey = Aes128Key([2; 16]);
        let a = uplink_frame(1, false)
            .compute_uplink_data_mic(MacVersion::Lorawan1_0, 0, 0, 0, fkey, skey)
            .unwrap();
        let b = uplink_frame(2, false)
            .compute_uplink_data_mic(MacVersion::Lorawan1_0, 0, 0, 0, fkey, skey)
            .unwrap();
        assert_ne!(a, b);
    }
}
