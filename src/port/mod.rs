//! Platform seam towards the mesh stack.
//!
//! The core only talks to the radio side through [`MeshPort`]. A port
//! implementation owns stack bring-up, outbound model messages and the
//! per-capability callbacks through which the stack reports incoming traffic.
//! Those callbacks are handed a [`Ingress`] closure that turns a
//! [`PortEvent`] into a control-bus message; they never touch element state
//! directly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::composition::{Composition, ModelId};
use crate::error::Result;

#[cfg(feature = "sim-port")]
pub mod sim;

/// Longest unprovisioned device name the advertising payload can carry.
pub const DEVICE_NAME_MAX: usize = 29;

pub mod bearer {
    pub const ADV: u8 = 0x01;
    pub const GATT: u8 = 0x02;
}

/// Address classification.
pub mod addr {
    pub const UNASSIGNED: u16 = 0x0000;
    pub const ALL_NODES: u16 = 0xFFFF;

    pub fn is_unassigned(addr: u16) -> bool {
        addr == UNASSIGNED
    }

    pub fn is_unicast(addr: u16) -> bool {
        (0x0001..=0x7FFF).contains(&addr)
    }

    pub fn is_virtual(addr: u16) -> bool {
        (0x8000..=0xBFFF).contains(&addr)
    }

    pub fn is_group(addr: u16) -> bool {
        addr >= 0xC000
    }

    pub fn is_broadcast(addr: u16) -> bool {
        addr == ALL_NODES
    }
}

pub mod opcode {
    pub const GEN_ONOFF_GET: u32 = 0x8201;
    pub const GEN_ONOFF_SET: u32 = 0x8202;
    pub const GEN_ONOFF_SET_UNACK: u32 = 0x8203;
    pub const GEN_ONOFF_STATUS: u32 = 0x8204;

    pub const LIGHT_CTL_GET: u32 = 0x825D;
    pub const LIGHT_CTL_SET: u32 = 0x825E;
    pub const LIGHT_CTL_SET_UNACK: u32 = 0x825F;
    pub const LIGHT_CTL_STATUS: u32 = 0x8260;
    pub const LIGHT_CTL_TEMPERATURE_GET: u32 = 0x8261;
    pub const LIGHT_CTL_TEMPERATURE_RANGE_GET: u32 = 0x8262;
    pub const LIGHT_CTL_TEMPERATURE_RANGE_STATUS: u32 = 0x8263;
    pub const LIGHT_CTL_TEMPERATURE_SET: u32 = 0x8264;
    pub const LIGHT_CTL_TEMPERATURE_SET_UNACK: u32 = 0x8265;
    pub const LIGHT_CTL_TEMPERATURE_STATUS: u32 = 0x8266;
    pub const LIGHT_CTL_DEFAULT_GET: u32 = 0x8267;
    pub const LIGHT_CTL_DEFAULT_STATUS: u32 = 0x8268;
    pub const LIGHT_CTL_DEFAULT_SET: u32 = 0x8269;
    pub const LIGHT_CTL_DEFAULT_SET_UNACK: u32 = 0x826A;
    pub const LIGHT_CTL_TEMPERATURE_RANGE_SET: u32 = 0x826B;
    pub const LIGHT_CTL_TEMPERATURE_RANGE_SET_UNACK: u32 = 0x826C;
}

/// Receive or send context of one access message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCtx {
    pub net_idx: u16,
    pub app_idx: u16,
    pub src_addr: u16,
    pub dst_addr: u16,
    pub opcode: u32,
    pub ttl: u8,
}

/// Identifies a model instance on the node together with its current
/// publication address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub element_idx: u16,
    pub model_id: ModelId,
    pub pub_addr: u16,
}

/// Data shared by the provisioning-capable models at stack bring-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningDescriptor {
    pub uuid: [u8; 16],
    pub output_size: u8,
    pub output_actions: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightCtlParams {
    pub lightness: u16,
    pub temperature: u16,
    pub delta_uv: u16,
    pub range_min: u16,
    pub range_max: u16,
}

impl Default for LightCtlParams {
    fn default() -> Self {
        Self {
            lightness: 0,
            temperature: 0x0320,
            delta_uv: 0,
            range_min: 0x0320,
            range_max: 0x4E20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenServerEvent {
    pub ctx: MsgCtx,
    pub model: ModelRef,
    pub onoff: u8,
}

/// The opcode in `ctx` selects which fields of `params` are meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightServerEvent {
    pub ctx: MsgCtx,
    pub model: ModelRef,
    pub params: LightCtlParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvt {
    Get,
    Set,
    Publish,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenClientEvent {
    pub ctx: MsgCtx,
    pub model: ModelRef,
    pub evt: ClientEvt,
    pub present_onoff: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientEvent {
    pub ctx: MsgCtx,
    pub model: ModelRef,
    pub evt: ClientEvt,
    pub params: LightCtlParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigServerEvent {
    pub element_addr: u16,
    pub pub_addr: u16,
    pub app_idx: u16,
    pub model_id: ModelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvEvent {
    pub net_idx: u16,
    pub addr: u16,
}

/// Registered callback groups a port reports through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    GenericServer,
    LightingServer,
    GenericClient,
    LightingClient,
    ConfigServer,
    Provisioning,
}

/// Everything a port can report to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    GenServer(GenServerEvent),
    LightServer(LightServerEvent),
    GenClient(GenClientEvent),
    LightClient(LightClientEvent),
    /// `evt` is one of the `frm_ble::CFG_*` bits.
    Config { evt: u32, event: ConfigServerEvent },
    /// `evt` is one of the `system::PROVISIONING` bits.
    Provisioning { evt: u32, event: ProvEvent },
}

impl PortEvent {
    pub fn capability(&self) -> Capability {
        match self {
            PortEvent::GenServer(_) => Capability::GenericServer,
            PortEvent::LightServer(_) => Capability::LightingServer,
            PortEvent::GenClient(_) => Capability::GenericClient,
            PortEvent::LightClient(_) => Capability::LightingClient,
            PortEvent::Config { .. } => Capability::ConfigServer,
            PortEvent::Provisioning { .. } => Capability::Provisioning,
        }
    }
}

/// Callback a port invokes from its own context for each incoming event.
pub type Ingress = Arc<dyn Fn(PortEvent) -> Result<()> + Send + Sync>;

/// Operations the core requires from a mesh stack.
pub trait MeshPort: Send + Sync {
    /// Storage subsystem bring-up. May fail with `NoFreePages`.
    fn platform_init(&self) -> Result<()>;
    fn platform_erase(&self) -> Result<()>;
    fn bt_init(&self) -> Result<()>;
    fn stack_init(&self, prov: &ProvisioningDescriptor, comp: &Composition) -> Result<()>;
    fn set_device_name(&self, name: &str) -> Result<()>;
    fn enable_provisioning(&self, bearers: u8) -> Result<()>;
    fn send_msg(&self, model: &ModelRef, ctx: &MsgCtx, opcode: u32, payload: &[u8]) -> Result<()>;
    /// Publish to the model's configured publication address.
    fn publish(&self, model: &ModelRef, opcode: u32, payload: &[u8]) -> Result<()>;
    fn is_group_subscribed(&self, model: &ModelRef, group: u16) -> bool;
    fn register_callback(&self, cap: Capability, ingress: Ingress) -> Result<()>;
}
