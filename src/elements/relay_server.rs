//! Relay (switch) server element: one Generic OnOff server per instance.

use std::sync::Arc;

use log::debug;

use super::{subscribe_block, subscribe_config_server, ElementBlock, ElementFactory};
use crate::api::{func_id, ApiPayload, RelayServerEvt};
use crate::composition::{sig, ElementType};
use crate::control::{frm_ble, Code, EventMask};
use crate::error::Result;
use crate::models::{decode, onoff_server};
use crate::node::Device;
use crate::port::GenServerEvent;

pub struct RelayServerFactory;

impl ElementFactory for RelayServerFactory {
    fn element_type(&self) -> ElementType {
        ElementType::RelayServer
    }

    fn sig_models(&self) -> &'static [u16] {
        &[sig::GEN_ONOFF_SRV]
    }

    fn supports_root_fold(&self) -> bool {
        true
    }

    fn subscribe(&self, dev: &Device, block: Arc<ElementBlock>) -> Result<()> {
        subscribe_block(dev, Code::FrmBle, frm_ble::GEN_ONOFF_SRV, &block, on_onoff)?;
        subscribe_config_server(dev, &block)
    }
}

fn on_onoff(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let ev: GenServerEvent = decode(payload)?;
    let element_id = ev.model.element_idx;
    let hal = match block.with_ctx(element_id, |ctx| onoff_server::handle(dev, &ev, &mut ctx.on_off)) {
        Some(r) => r?,
        None => return Ok(()),
    };
    if let Some(hal) = hal {
        debug!("relay server {} -> {}", element_id, hal.on_off);
        block.persist(dev, element_id);
        let evt = RelayServerEvt { on_off: hal.on_off };
        dev.api
            .try_send_to_app(element_id, ElementType::RelayServer, func_id::ONOFF, &evt.to_bytes())?;
    }
    Ok(())
}
