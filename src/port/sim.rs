//! In-process port that records every call and lets callers inject stack
//! events. Used by the `meshx` binary and by the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};

use super::{Capability, Ingress, MeshPort, ModelRef, MsgCtx, PortEvent, ProvEvent, ProvisioningDescriptor};
use super::DEVICE_NAME_MAX;
use crate::composition::Composition;
use crate::control::system;
use crate::error::{MeshxError, Result};
use crate::logutil::{escape_log, hex_preview};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCall {
    PlatformInit,
    PlatformErase,
    BtInit,
    StackInit { element_count: usize, uuid: [u8; 16] },
    SetDeviceName(String),
    EnableProvisioning(u8),
    Send {
        model: ModelRef,
        ctx: MsgCtx,
        opcode: u32,
        payload: Vec<u8>,
    },
    Publish {
        model: ModelRef,
        opcode: u32,
        payload: Vec<u8>,
    },
}

#[derive(Default)]
pub struct SimPort {
    calls: Mutex<Vec<PortCall>>,
    callbacks: Mutex<HashMap<Capability, Ingress>>,
    groups: Mutex<HashSet<(u16, u16)>>,
    storage_full: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `platform_init` reports `NoFreePages`.
    pub fn with_full_storage() -> Self {
        let port = Self::default();
        port.storage_full.store(true, Ordering::SeqCst);
        port
    }

    fn record(&self, call: PortCall) {
        lock(&self.calls).push(call);
    }

    pub fn calls(&self) -> Vec<PortCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn sent(&self) -> Vec<(ModelRef, MsgCtx, u32, Vec<u8>)> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                PortCall::Send {
                    model,
                    ctx,
                    opcode,
                    payload,
                } => Some((model.clone(), ctx.clone(), *opcode, payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(ModelRef, u32, Vec<u8>)> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                PortCall::Publish {
                    model,
                    opcode,
                    payload,
                } => Some((model.clone(), *opcode, payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn subscribe_group(&self, element_idx: u16, group: u16) {
        lock(&self.groups).insert((element_idx, group));
    }

    pub fn has_callback(&self, cap: Capability) -> bool {
        lock(&self.callbacks).contains_key(&cap)
    }

    /// Deliver `event` through the callback registered for its capability.
    pub fn inject(&self, event: PortEvent) -> Result<()> {
        let cap = event.capability();
        let ingress = lock(&self.callbacks)
            .get(&cap)
            .cloned()
            .ok_or_else(|| MeshxError::NotFound(format!("no callback for {:?}", cap)))?;
        ingress(event)
    }

    pub fn complete_provisioning(&self, net_idx: u16, addr: u16) -> Result<()> {
        self.inject(PortEvent::Provisioning {
            evt: system::PROV_COMPLETE,
            event: ProvEvent { net_idx, addr },
        })
    }

    pub fn node_reset(&self) -> Result<()> {
        self.inject(PortEvent::Provisioning {
            evt: system::NODE_RESET,
            event: ProvEvent { net_idx: 0, addr: 0 },
        })
    }
}

impl MeshPort for SimPort {
    fn platform_init(&self) -> Result<()> {
        self.record(PortCall::PlatformInit);
        if self.storage_full.swap(false, Ordering::SeqCst) {
            return Err(MeshxError::NoFreePages);
        }
        Ok(())
    }

    fn platform_erase(&self) -> Result<()> {
        self.record(PortCall::PlatformErase);
        Ok(())
    }

    fn bt_init(&self) -> Result<()> {
        self.record(PortCall::BtInit);
        Ok(())
    }

    fn stack_init(&self, prov: &ProvisioningDescriptor, comp: &Composition) -> Result<()> {
        info!(
            "sim stack up: cid=0x{:04x} pid=0x{:04x} elements={}",
            comp.cid,
            comp.pid,
            comp.element_count()
        );
        self.record(PortCall::StackInit {
            element_count: comp.element_count(),
            uuid: prov.uuid,
        });
        Ok(())
    }

    fn set_device_name(&self, name: &str) -> Result<()> {
        if name.len() > DEVICE_NAME_MAX {
            return Err(MeshxError::invalid_arg(format!(
                "device name '{}' longer than {} bytes",
                escape_log(name),
                DEVICE_NAME_MAX
            )));
        }
        self.record(PortCall::SetDeviceName(name.to_string()));
        Ok(())
    }

    fn enable_provisioning(&self, bearers: u8) -> Result<()> {
        self.record(PortCall::EnableProvisioning(bearers));
        Ok(())
    }

    fn send_msg(&self, model: &ModelRef, ctx: &MsgCtx, opcode: u32, payload: &[u8]) -> Result<()> {
        debug!(
            "sim send el={} {} op=0x{:04x} dst=0x{:04x} [{}]",
            model.element_idx,
            model.model_id,
            opcode,
            ctx.dst_addr,
            hex_preview(payload)
        );
        self.record(PortCall::Send {
            model: model.clone(),
            ctx: ctx.clone(),
            opcode,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn publish(&self, model: &ModelRef, opcode: u32, payload: &[u8]) -> Result<()> {
        debug!(
            "sim publish el={} {} op=0x{:04x} to 0x{:04x} [{}]",
            model.element_idx,
            model.model_id,
            opcode,
            model.pub_addr,
            hex_preview(payload)
        );
        self.record(PortCall::Publish {
            model: model.clone(),
            opcode,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn is_group_subscribed(&self, model: &ModelRef, group: u16) -> bool {
        lock(&self.groups).contains(&(model.element_idx, group))
    }

    fn register_callback(&self, cap: Capability, ingress: Ingress) -> Result<()> {
        lock(&self.callbacks).insert(cap, ingress);
        Ok(())
    }
}
