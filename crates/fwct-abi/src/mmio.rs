//! MMIO self-configuration messages.
//!
//! Buffer registration and ring enable/disable travel outside the rings (through scratch
//! registers) so they work before the rings exist. Every message starts with an HXG REQUEST
//! header.
//!
//! SELF_CFG layout (all little-endian `u32`):
//! - HXG header, action [`crate::action::SELF_CFG`]
//! - `{key:16 @31..16, len:16 @15..0}`
//! - value bits 31..0
//! - value bits 63..32
//!
//! The firmware replies with the number of KLVs it accepted in `data0`.
//!
//! CONTROL_CTB layout:
//! - HXG header, action [`crate::action::CONTROL_CTB`]
//! - [`CTB_CONTROL_ENABLE`] or [`CTB_CONTROL_DISABLE`]

use crate::action;
use crate::hxg::{HxgHeader, HxgType};

pub const KLV_H2G_CTB_ADDR: u16 = 0x0902;
pub const KLV_H2G_CTB_DESCRIPTOR_ADDR: u16 = 0x0903;
pub const KLV_H2G_CTB_SIZE: u16 = 0x0904;
pub const KLV_G2H_CTB_ADDR: u16 = 0x0905;
pub const KLV_G2H_CTB_DESCRIPTOR_ADDR: u16 = 0x0906;
pub const KLV_G2H_CTB_SIZE: u16 = 0x0907;

pub const SELF_CFG_MSG_LEN: usize = 4;
pub const CONTROL_CTB_MSG_LEN: usize = 2;

pub const CTB_CONTROL_DISABLE: u32 = 0;
pub const CTB_CONTROL_ENABLE: u32 = 1;

/// Value length of a KLV key in words.
pub fn klv_len(key: u16) -> u16 {
    match key {
        KLV_H2G_CTB_SIZE | KLV_G2H_CTB_SIZE => 1,
        _ => 2,
    }
}

pub fn self_cfg(key: u16, value: u64) -> [u32; SELF_CFG_MSG_LEN] {
    [
        HxgHeader::request(action::SELF_CFG).encode(),
        (u32::from(key) << 16) | u32::from(klv_len(key)),
        value as u32,
        (value >> 32) as u32,
    ]
}

pub fn control_ctb(enable: bool) -> [u32; CONTROL_CTB_MSG_LEN] {
    [
        HxgHeader::request(action::CONTROL_CTB).encode(),
        if enable {
            CTB_CONTROL_ENABLE
        } else {
            CTB_CONTROL_DISABLE
        },
    ]
}

/// A decoded SELF_CFG request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfCfg {
    pub key: u16,
    pub len: u16,
    pub value: u64,
}

/// A decoded MMIO request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioRequest {
    SelfCfg(SelfCfg),
    ControlCtb { enable: bool },
}

impl MmioRequest {
    pub fn decode(msg: &[u32]) -> Option<Self> {
        let hdr = HxgHeader::decode(*msg.first()?).ok()?;
        if hdr.ty != HxgType::Request {
            return None;
        }
        match hdr.action() {
            action::SELF_CFG if msg.len() == SELF_CFG_MSG_LEN => {
                let value = u64::from(msg[2]) | (u64::from(msg[3]) << 32);
                Some(MmioRequest::SelfCfg(SelfCfg {
                    key: (msg[1] >> 16) as u16,
                    len: msg[1] as u16,
                    value,
                }))
            }
            action::CONTROL_CTB if msg.len() == CONTROL_CTB_MSG_LEN => match msg[1] {
                CTB_CONTROL_ENABLE => Some(MmioRequest::ControlCtb { enable: true }),
                CTB_CONTROL_DISABLE => Some(MmioRequest::ControlCtb { enable: false }),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn self_cfg_splits_value_words() {
        let msg = self_cfg(KLV_G2H_CTB_ADDR, 0x1_2345_6000);
        assert_eq!(msg[1], 0x0905_0002);
        assert_eq!(msg[2], 0x2345_6000);
        assert_eq!(msg[3], 0x1);

        assert_eq!(
            MmioRequest::decode(&msg),
            Some(MmioRequest::SelfCfg(SelfCfg {
                key: KLV_G2H_CTB_ADDR,
                len: 2,
                value: 0x1_2345_6000,
            }))
        );
    }

    #[test]
    fn size_keys_are_single_word() {
        let msg = self_cfg(KLV_H2G_CTB_SIZE, 4096);
        assert_eq!(msg[1] & 0xffff, 1);
    }

    #[test]
    fn control_ctb_decodes() {
        assert_eq!(
            MmioRequest::decode(&control_ctb(true)),
            Some(MmioRequest::ControlCtb { enable: true })
        );
        assert_eq!(
            MmioRequest::decode(&control_ctb(false)),
            Some(MmioRequest::ControlCtb { enable: false })
        );
        assert_eq!(MmioRequest::decode(&[control_ctb(true)[0], 7]), None);
        assert_eq!(MmioRequest::decode(&[]), None);
    }
}
