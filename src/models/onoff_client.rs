//! Generic OnOff client.

use log::debug;

use super::{BleRequest, ElStateChange};
use crate::composition::{sig, ModelId};
use crate::error::{err_code, Result};
use crate::node::Device;
use crate::port::{opcode, ClientEvt, GenClientEvent, LightCtlParams, ModelRef, MsgCtx};
use crate::txcm::TxMsg;

/// GET for reads, otherwise SET or SET_UNACK depending on `ack`.
pub fn opcode_for(req: &BleRequest) -> u32 {
    if req.is_get() {
        opcode::GEN_ONOFF_GET
    } else if req.ack {
        opcode::GEN_ONOFF_SET
    } else {
        opcode::GEN_ONOFF_SET_UNACK
    }
}

/// Hand one request from element `req.element_id` to `pub_addr` to the
/// transmit queue.
pub fn send(dev: &Device, req: &BleRequest, pub_addr: u16, app_id: u16, tid: u8) -> Result<u32> {
    let op = opcode_for(req);
    let model = ModelRef {
        element_idx: req.element_id,
        model_id: ModelId::Sig(sig::GEN_ONOFF_CLI),
        pub_addr,
    };
    let ctx = MsgCtx {
        net_idx: dev.net_key_id(),
        app_idx: app_id,
        src_addr: 0,
        dst_addr: pub_addr,
        opcode: op,
        ttl: crate::composition::TTL_DEFAULT,
    };
    let payload: Vec<u8> = if req.is_get() {
        Vec::new()
    } else {
        vec![req.on_off, tid]
    };
    debug!(
        "onoff cli el={} op=0x{:04x} dst=0x{:04x} tid={}",
        req.element_id, op, pub_addr, tid
    );
    dev.txcm.submit(
        dev.port.as_ref(),
        TxMsg {
            model,
            ctx,
            opcode: op,
            body: payload,
        },
    )?;
    Ok(op)
}

/// Element-layer notification for one client event.
pub fn state_change(ev: &GenClientEvent) -> ElStateChange {
    ElStateChange {
        element_id: ev.model.element_idx,
        err_code: match ev.evt {
            ClientEvt::Timeout => err_code::TIMEOUT,
            _ => err_code::SUCCESS,
        },
        opcode: ev.ctx.opcode,
        on_off: ev.present_onoff,
        ctl: LightCtlParams::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MSG_GET, MSG_SET};

    #[test]
    fn get_is_distinguished_from_set() {
        assert_eq!(opcode_for(&BleRequest::onoff(1, MSG_GET, true, 0)), opcode::GEN_ONOFF_GET);
        assert_eq!(opcode_for(&BleRequest::onoff(1, MSG_SET, true, 0)), opcode::GEN_ONOFF_SET);
        assert_eq!(
            opcode_for(&BleRequest::onoff(1, MSG_SET, false, 0)),
            opcode::GEN_ONOFF_SET_UNACK
        );
    }

    #[test]
    fn timeout_maps_to_timeout_code() {
        let ev = GenClientEvent {
            ctx: MsgCtx::default(),
            model: ModelRef {
                element_idx: 1,
                model_id: ModelId::Sig(sig::GEN_ONOFF_CLI),
                pub_addr: 0,
            },
            evt: ClientEvt::Timeout,
            present_onoff: 0,
        };
        assert_eq!(state_change(&ev).err_code, err_code::TIMEOUT);
    }
}
