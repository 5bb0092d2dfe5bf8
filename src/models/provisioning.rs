//! Root provisioning handler.
//!
//! Subscribed under `SYSTEM` with the provisioning bits. Completion stores
//! the primary address and network key index, re-addresses the composition
//! and tells the application. A node reset erases everything the node
//! persisted.

use bytes::BufMut;
use log::{info, warn};

use super::decode;
use crate::control::{system, EventMask};
use crate::error::Result;
use crate::node::{Device, MeshxStore, MESHX_STORE_KEY};
use crate::port::ProvEvent;

pub const HANDLED: EventMask = system::PROVISIONING;

fn ctrl_payload(ev: &ProvEvent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.put_u16_le(ev.net_idx);
    buf.put_u16_le(ev.addr);
    buf
}

pub fn on_system_event(dev: &Device, evt: EventMask, payload: &[u8]) -> Result<()> {
    if evt & system::PROV_COMPLETE != 0 {
        let ev: ProvEvent = decode(payload)?;
        info!(
            "provisioning complete: net_idx=0x{:03x} addr=0x{:04x}",
            ev.net_idx, ev.addr
        );
        let store = MeshxStore {
            net_key_id: ev.net_idx,
            node_addr: ev.addr,
        };
        dev.set_store(store);
        dev.nvs.set_value(MESHX_STORE_KEY, &store, true)?;
        dev.with_composition(|comp| comp.assign_addresses(ev.addr));
        dev.api
            .try_send_ctrl_to_app(system::PROV_COMPLETE as u16, &ctrl_payload(&ev))?;
    }
    if evt & system::NODE_RESET != 0 {
        warn!("node reset requested, erasing persisted state");
        dev.set_store(MeshxStore::default());
        dev.nvs.erase()?;
        dev.nvs.commit()?;
        dev.with_composition(|comp| comp.clear_addresses());
        dev.api.try_send_ctrl_to_app(system::NODE_RESET as u16, &[])?;
    }
    if evt & system::IDENTIFY_START != 0 {
        info!("identify start");
    }
    if evt & system::IDENTIFY_STOP != 0 {
        info!("identify stop");
    }
    if evt & system::PROXY_CONNECT != 0 {
        info!("proxy connected");
    }
    if evt & system::PROXY_DISCONNECT != 0 {
        info!("proxy disconnected");
    }
    Ok(())
}
