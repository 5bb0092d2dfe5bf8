//! Model-level behaviour shared by the element types.
//!
//! Each submodule holds the opcode handling for one SIG model. Element
//! types own the state and call into these functions from their bus
//! handlers. This module also defines the bus payloads exchanged between
//! the model layer, the element layer and the HAL.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::port::LightCtlParams;

pub mod config_server;
pub mod light_ctl_client;
pub mod light_ctl_server;
pub mod onoff_client;
pub mod onoff_server;
pub mod provisioning;

/// Largest bincode payload the core itself publishes on the bus.
pub const MIN_BUS_PAYLOAD: usize = 48;

/// `set_get` values in client requests.
pub const MSG_SET: u8 = 0;
pub const MSG_GET: u8 = 1;

/// Which CTL fields a client request carries.
pub mod arg_bmap {
    pub const ONOFF_SET: u8 = 1 << 0;
    pub const LIGHTNESS_SET: u8 = 1 << 1;
    pub const TEMPERATURE_SET: u8 = 1 << 2;
    pub const DELTA_UV_SET: u8 = 1 << 3;
    pub const TEMPERATURE_RANGE_SET_MIN: u8 = 1 << 4;
    pub const TEMPERATURE_RANGE_SET_MAX: u8 = 1 << 5;

    pub const TEMPERATURE_RANGE_SET: u8 = TEMPERATURE_RANGE_SET_MIN | TEMPERATURE_RANGE_SET_MAX;
    pub const CTL_SET: u8 = LIGHTNESS_SET | TEMPERATURE_SET | DELTA_UV_SET;
    pub const ALL: u8 = ONOFF_SET | CTL_SET | TEMPERATURE_RANGE_SET;
}

/// Payload of `TO_HAL:SET_ON_OFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalOnOff {
    pub element_id: u16,
    pub on_off: u8,
}

/// Payload of `TO_HAL:SET_CTL` and `TO_HAL:SET_TEMP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalCtl {
    pub element_id: u16,
    pub lightness: u16,
    pub temperature: u16,
    pub delta_uv: u16,
}

/// Payload of `EL_STATE_CH`, produced from client model events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElStateChange {
    pub element_id: u16,
    pub err_code: u8,
    /// Opcode of the status (or of the timed-out request) behind the change.
    pub opcode: u32,
    pub on_off: u8,
    pub ctl: LightCtlParams,
}

/// Payload of `TO_BLE`: one outbound client request for a given element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleRequest {
    pub element_id: u16,
    pub set_get: u8,
    pub ack: bool,
    pub arg_bmap: u8,
    pub on_off: u8,
    pub ctl: LightCtlParams,
}

impl BleRequest {
    pub fn onoff(element_id: u16, set_get: u8, ack: bool, on_off: u8) -> Self {
        Self {
            element_id,
            set_get,
            ack,
            arg_bmap: arg_bmap::ONOFF_SET,
            on_off,
            ctl: LightCtlParams::default(),
        }
    }

    pub fn is_get(&self) -> bool {
        self.set_get == MSG_GET
    }
}

/// Decode a bincode bus payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}

/// Encode a bus payload with bincode.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::ModelId;
    use crate::port::{
        ClientEvt, ConfigServerEvent, GenClientEvent, GenServerEvent, LightClientEvent,
        LightServerEvent, ModelRef, MsgCtx,
    };

    fn model() -> ModelRef {
        ModelRef {
            element_idx: 1,
            model_id: ModelId::Vendor {
                company: 0x7908,
                id: 0x0001,
            },
            pub_addr: 0xC000,
        }
    }

    #[test]
    fn internal_payloads_fit_the_minimum_slot() {
        let sizes = [
            encode(&GenServerEvent {
                ctx: MsgCtx::default(),
                model: model(),
                onoff: 1,
            })
            .unwrap()
            .len(),
            encode(&LightServerEvent {
                ctx: MsgCtx::default(),
                model: model(),
                params: LightCtlParams::default(),
            })
            .unwrap()
            .len(),
            encode(&GenClientEvent {
                ctx: MsgCtx::default(),
                model: model(),
                evt: ClientEvt::Timeout,
                present_onoff: 0,
            })
            .unwrap()
            .len(),
            encode(&LightClientEvent {
                ctx: MsgCtx::default(),
                model: model(),
                evt: ClientEvt::Publish,
                params: LightCtlParams::default(),
            })
            .unwrap()
            .len(),
            encode(&ConfigServerEvent {
                element_addr: 2,
                pub_addr: 0xC001,
                app_idx: 0,
                model_id: model().model_id,
            })
            .unwrap()
            .len(),
            encode(&BleRequest::onoff(1, MSG_SET, true, 1)).unwrap().len(),
        ];
        for size in sizes {
            assert!(size <= MIN_BUS_PAYLOAD, "{} > {}", size, MIN_BUS_PAYLOAD);
        }
    }
}
