//! Message codes and per-code event bits.
//!
//! Numeric values are part of the application-facing API and must stay put.

use serde::{Deserialize, Serialize};

use crate::error::{MeshxError, Result};

pub type EventMask = u32;

pub const fn bit(n: u32) -> EventMask {
    1 << n
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Code {
    /// Internal lifecycle events (fresh boot, timers, provisioning).
    System = 0,
    /// Element to application.
    ToApp = 1,
    /// Application to element core.
    ToMeshx = 2,
    /// Core to mesh stack send requests.
    ToBle = 3,
    /// Mesh stack to core.
    FrmBle = 4,
    /// Core to hardware abstraction.
    ToHal = 5,
    /// Element-layer cross notification.
    ElStateCh = 6,
}

pub const CODE_MAX: usize = 7;

impl Code {
    pub const ALL: [Code; CODE_MAX] = [
        Code::System,
        Code::ToApp,
        Code::ToMeshx,
        Code::ToBle,
        Code::FrmBle,
        Code::ToHal,
        Code::ElStateCh,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Code::System => "SYSTEM",
            Code::ToApp => "TO_APP",
            Code::ToMeshx => "TO_MESHX",
            Code::ToBle => "TO_BLE",
            Code::FrmBle => "FRM_BLE",
            Code::ToHal => "TO_HAL",
            Code::ElStateCh => "EL_STATE_CH",
        }
    }
}

impl TryFrom<u8> for Code {
    type Error = MeshxError;

    fn try_from(raw: u8) -> Result<Self> {
        Code::ALL
            .get(usize::from(raw))
            .copied()
            .ok_or_else(|| MeshxError::invalid_arg(format!("message code {} out of range", raw)))
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub mod system {
    use super::{bit, EventMask};
    pub const RESTART: EventMask = bit(0);
    pub const TIMER_ARM: EventMask = bit(1);
    pub const TIMER_REARM: EventMask = bit(2);
    pub const TIMER_DISARM: EventMask = bit(3);
    pub const TIMER_FIRE: EventMask = bit(4);
    pub const TIMER_PERIOD: EventMask = bit(5);
    pub const FRESH_BOOT: EventMask = bit(6);
    pub const PROV_COMPLETE: EventMask = bit(7);
    pub const IDENTIFY_START: EventMask = bit(8);
    pub const IDENTIFY_STOP: EventMask = bit(9);
    pub const NODE_RESET: EventMask = bit(10);
    pub const PROXY_CONNECT: EventMask = bit(11);
    pub const PROXY_DISCONNECT: EventMask = bit(12);

    pub const PROVISIONING: EventMask = PROV_COMPLETE
        | IDENTIFY_START
        | IDENTIFY_STOP
        | NODE_RESET
        | PROXY_CONNECT
        | PROXY_DISCONNECT;
}

/// Shared by `TO_APP` and `TO_MESHX`.
pub mod api {
    use super::{bit, EventMask};
    pub const DATA: EventMask = bit(0);
    pub const CTRL: EventMask = bit(1);
}

pub mod to_ble {
    use super::{bit, EventMask};
    pub const SET_ON_OFF: EventMask = bit(0);
    pub const SET_CTL: EventMask = bit(1);
    pub const SET_LIGHTNESS: EventMask = bit(2);
}

pub mod frm_ble {
    use super::{bit, EventMask};
    pub const GEN_ONOFF_SRV: EventMask = bit(0);
    pub const LIGHT_CTL_SRV: EventMask = bit(1);
    pub const GEN_ONOFF_CLI: EventMask = bit(2);
    pub const LIGHT_CTL_CLI: EventMask = bit(3);
    pub const CFG_APP_KEY_BIND: EventMask = bit(4);
    pub const CFG_PUB_ADD: EventMask = bit(5);
    pub const CFG_PUB_DEL: EventMask = bit(6);
    pub const CFG_SUB_ADD: EventMask = bit(7);
    pub const CFG_SUB_DEL: EventMask = bit(8);

    pub const CONFIG_SERVER: EventMask =
        CFG_APP_KEY_BIND | CFG_PUB_ADD | CFG_PUB_DEL | CFG_SUB_ADD | CFG_SUB_DEL;
}

pub mod to_hal {
    use super::{bit, EventMask};
    pub const SET_ON_OFF: EventMask = bit(0);
    pub const SET_TEMP: EventMask = bit(1);
    pub const SET_LIGHTNESS: EventMask = bit(2);
    pub const SET_CTL: EventMask = bit(3);
}

pub mod el_state {
    use super::{bit, EventMask};
    pub const SET_ON_OFF: EventMask = bit(0);
    pub const SET_CTL: EventMask = bit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_round_trip_and_max_is_rejected() {
        for code in Code::ALL {
            assert_eq!(Code::try_from(code as u8).unwrap(), code);
        }
        assert!(matches!(
            Code::try_from(CODE_MAX as u8),
            Err(MeshxError::InvalidArg(_))
        ));
    }

    #[test]
    fn config_server_bits_do_not_overlap_model_bits() {
        let models = frm_ble::GEN_ONOFF_SRV
            | frm_ble::LIGHT_CTL_SRV
            | frm_ble::GEN_ONOFF_CLI
            | frm_ble::LIGHT_CTL_CLI;
        assert_eq!(models & frm_ble::CONFIG_SERVER, 0);
    }
}
