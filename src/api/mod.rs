//! # Application API boundary
//!
//! Element traffic crosses between the core and the application as a fixed
//! layout envelope: an 8-byte header region followed by a payload region
//! sized to the largest payload variant. All fields are little-endian.
//!
//! ```text
//! element message:  element_id:u16 | element_type:u16 | func_id:u16 | msg_len:u16 | payload[PAYLOAD_MAX]
//! control message:  evt:u16        | reserved:u16     | (pad:4)                  | payload[PAYLOAD_MAX]
//! ```
//!
//! [`ApiBoundary`] publishes envelopes under `TO_APP` / `TO_MESHX` and, once
//! the application has registered callbacks, forwards dispatched `TO_APP`
//! envelopes to them.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace};

use crate::composition::ElementType;
use crate::control::{api, Code, ControlBus, EventMask, HandlerRef};
use crate::error::{MeshxError, Result};
use crate::logutil::hex_preview;

pub const HEADER_REGION: usize = 8;
pub const PAYLOAD_MAX: usize = CwwwClientReq::LEN;
pub const ENVELOPE_LEN: usize = HEADER_REGION + PAYLOAD_MAX;

pub mod func_id {
    pub const ONOFF: u16 = 0;
    pub const CTL: u16 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementMsgHeader {
    pub element_id: u16,
    pub element_type: u16,
    pub func_id: u16,
    pub msg_len: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlMsgHeader {
    pub evt: u16,
    pub reserved: u16,
}

/// Fixed-size little-endian payload body.
pub trait ApiPayload: Sized {
    const LEN: usize;
    fn put(&self, buf: &mut BytesMut);
    fn get(buf: &mut &[u8]) -> Self;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        self.put(&mut buf);
        buf.to_vec()
    }

    fn from_bytes(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::LEN {
            return Err(MeshxError::invalid_arg(format!(
                "payload of {} bytes, need {}",
                raw.len(),
                Self::LEN
            )));
        }
        Ok(Self::get(&mut raw))
    }
}

fn put_ctl(buf: &mut BytesMut, c: &CtlFields) {
    buf.put_u16_le(c.lightness);
    buf.put_u16_le(c.temperature);
    buf.put_u16_le(c.delta_uv);
    buf.put_u16_le(c.range_min);
    buf.put_u16_le(c.range_max);
}

fn get_ctl(buf: &mut &[u8]) -> CtlFields {
    CtlFields {
        lightness: buf.get_u16_le(),
        temperature: buf.get_u16_le(),
        delta_uv: buf.get_u16_le(),
        range_min: buf.get_u16_le(),
        range_max: buf.get_u16_le(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtlFields {
    pub lightness: u16,
    pub temperature: u16,
    pub delta_uv: u16,
    pub range_min: u16,
    pub range_max: u16,
}

impl From<crate::port::LightCtlParams> for CtlFields {
    fn from(p: crate::port::LightCtlParams) -> Self {
        Self {
            lightness: p.lightness,
            temperature: p.temperature,
            delta_uv: p.delta_uv,
            range_min: p.range_min,
            range_max: p.range_max,
        }
    }
}

impl From<CtlFields> for crate::port::LightCtlParams {
    fn from(c: CtlFields) -> Self {
        Self {
            lightness: c.lightness,
            temperature: c.temperature,
            delta_uv: c.delta_uv,
            range_min: c.range_min,
            range_max: c.range_max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayServerEvt {
    pub on_off: u8,
}

impl ApiPayload for RelayServerEvt {
    const LEN: usize = 1;
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.on_off);
    }
    fn get(buf: &mut &[u8]) -> Self {
        Self { on_off: buf.get_u8() }
    }
}

/// CWWW server notification; `func_id` tells which half is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwwwServerEvt {
    OnOff { state: u8 },
    Ctl(CtlFields),
}

impl CwwwServerEvt {
    pub fn func_id(&self) -> u16 {
        match self {
            CwwwServerEvt::OnOff { .. } => func_id::ONOFF,
            CwwwServerEvt::Ctl(_) => func_id::CTL,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(10);
        match self {
            CwwwServerEvt::OnOff { state } => buf.put_u8(*state),
            CwwwServerEvt::Ctl(c) => put_ctl(&mut buf, c),
        }
        buf.to_vec()
    }

    pub fn parse(func: u16, mut raw: &[u8]) -> Result<Self> {
        match func {
            func_id::ONOFF if !raw.is_empty() => Ok(CwwwServerEvt::OnOff { state: raw.get_u8() }),
            func_id::CTL if raw.len() >= 10 => Ok(CwwwServerEvt::Ctl(get_ctl(&mut raw))),
            _ => Err(MeshxError::invalid_arg(format!(
                "cwww server payload func {} len {}",
                func,
                raw.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayClientEvt {
    pub err_code: u8,
    pub on_off: u8,
}

impl ApiPayload for RelayClientEvt {
    const LEN: usize = 2;
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.err_code);
        buf.put_u8(self.on_off);
    }
    fn get(buf: &mut &[u8]) -> Self {
        Self {
            err_code: buf.get_u8(),
            on_off: buf.get_u8(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CwwwClientEvt {
    pub err_code: u8,
    pub on_off: u8,
    pub ctl: CtlFields,
}

impl ApiPayload for CwwwClientEvt {
    const LEN: usize = 12;
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.err_code);
        buf.put_u8(self.on_off);
        put_ctl(buf, &self.ctl);
    }
    fn get(buf: &mut &[u8]) -> Self {
        Self {
            err_code: buf.get_u8(),
            on_off: buf.get_u8(),
            ctl: get_ctl(buf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayClientReq {
    pub set_get: u8,
    pub ack: u8,
    pub on_off: u8,
}

impl ApiPayload for RelayClientReq {
    const LEN: usize = 3;
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.set_get);
        buf.put_u8(self.ack);
        buf.put_u8(self.on_off);
    }
    fn get(buf: &mut &[u8]) -> Self {
        Self {
            set_get: buf.get_u8(),
            ack: buf.get_u8(),
            on_off: buf.get_u8(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CwwwClientReq {
    pub set_get: u8,
    pub ack: u8,
    pub arg_bmap: u8,
    pub on_off: u8,
    pub ctl: CtlFields,
}

impl ApiPayload for CwwwClientReq {
    const LEN: usize = 14;
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.set_get);
        buf.put_u8(self.ack);
        buf.put_u8(self.arg_bmap);
        buf.put_u8(self.on_off);
        put_ctl(buf, &self.ctl);
    }
    fn get(buf: &mut &[u8]) -> Self {
        Self {
            set_get: buf.get_u8(),
            ack: buf.get_u8(),
            arg_bmap: buf.get_u8(),
            on_off: buf.get_u8(),
            ctl: get_ctl(buf),
        }
    }
}

/// Build an element envelope. `InvalidArg` when `payload` exceeds the
/// payload region.
pub fn pack_element(hdr_fields: (u16, u16, u16), payload: &[u8]) -> Result<Bytes> {
    if payload.len() > PAYLOAD_MAX {
        return Err(MeshxError::invalid_arg(format!(
            "element payload of {} bytes exceeds {}",
            payload.len(),
            PAYLOAD_MAX
        )));
    }
    let (element_id, element_type, func) = hdr_fields;
    let mut buf = BytesMut::with_capacity(ENVELOPE_LEN);
    buf.put_u16_le(element_id);
    buf.put_u16_le(element_type);
    buf.put_u16_le(func);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.resize(ENVELOPE_LEN, 0);
    Ok(buf.freeze())
}

pub fn pack_ctrl(evt: u16, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > PAYLOAD_MAX {
        return Err(MeshxError::invalid_arg(format!(
            "control payload of {} bytes exceeds {}",
            payload.len(),
            PAYLOAD_MAX
        )));
    }
    let mut buf = BytesMut::with_capacity(ENVELOPE_LEN);
    buf.put_u16_le(evt);
    buf.put_u16_le(0);
    buf.put_u32_le(0);
    buf.put_slice(payload);
    buf.resize(ENVELOPE_LEN, 0);
    Ok(buf.freeze())
}

/// Split an element envelope into its header and the used payload bytes.
pub fn unpack_element(raw: &[u8]) -> Result<(ElementMsgHeader, &[u8])> {
    if raw.len() < HEADER_REGION {
        return Err(MeshxError::invalid_arg(format!("envelope of {} bytes", raw.len())));
    }
    let mut hdr = &raw[..HEADER_REGION];
    let header = ElementMsgHeader {
        element_id: hdr.get_u16_le(),
        element_type: hdr.get_u16_le(),
        func_id: hdr.get_u16_le(),
        msg_len: hdr.get_u16_le(),
    };
    let len = usize::from(header.msg_len);
    if len > PAYLOAD_MAX || HEADER_REGION + len > raw.len() {
        return Err(MeshxError::invalid_arg(format!("msg_len {} out of range", len)));
    }
    Ok((header, &raw[HEADER_REGION..HEADER_REGION + len]))
}

/// Split a control envelope. The payload region is returned whole.
pub fn unpack_ctrl(raw: &[u8]) -> Result<(CtrlMsgHeader, &[u8])> {
    if raw.len() < HEADER_REGION {
        return Err(MeshxError::invalid_arg(format!("envelope of {} bytes", raw.len())));
    }
    let mut hdr = &raw[..4];
    let header = CtrlMsgHeader {
        evt: hdr.get_u16_le(),
        reserved: hdr.get_u16_le(),
    };
    Ok((header, &raw[HEADER_REGION..]))
}

pub type DataCallback = Arc<dyn Fn(&ElementMsgHeader, &[u8]) -> Result<()> + Send + Sync>;
pub type CtrlCallback = Arc<dyn Fn(&CtrlMsgHeader, &[u8]) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Slots {
    data: Option<DataCallback>,
    ctrl: Option<CtrlCallback>,
    data_subscribed: bool,
    ctrl_subscribed: bool,
}

/// Routes element and control envelopes between the bus and the
/// application.
pub struct ApiBoundary<C> {
    bus: Arc<ControlBus<C>>,
    slots: Arc<Mutex<Slots>>,
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

impl<C: 'static> ApiBoundary<C> {
    pub fn new(bus: Arc<ControlBus<C>>) -> Self {
        Self {
            bus,
            slots: Arc::default(),
        }
    }

    /// Publish an element notification under `TO_APP:DATA`, waiting for
    /// room on the bus.
    pub async fn send_to_app(&self, element_id: u16, element_type: ElementType, func: u16, payload: &[u8]) -> Result<()> {
        let env = self.element_envelope("to app", element_id, element_type, func, payload)?;
        self.bus.publish(Code::ToApp, api::DATA, &env).await
    }

    /// Publish an application request under `TO_MESHX:DATA`, waiting for
    /// room on the bus.
    pub async fn send_to_element(&self, element_id: u16, element_type: ElementType, func: u16, payload: &[u8]) -> Result<()> {
        let env = self.element_envelope("to element", element_id, element_type, func, payload)?;
        self.bus.publish(Code::ToMeshx, api::DATA, &env).await
    }

    /// Publish a system event under `TO_APP:CTRL`, waiting for room on the
    /// bus.
    pub async fn send_ctrl_to_app(&self, evt: u16, payload: &[u8]) -> Result<()> {
        let env = pack_ctrl(evt, payload)?;
        self.bus.publish(Code::ToApp, api::CTRL, &env).await
    }

    /// Non-blocking [`send_to_app`](Self::send_to_app) for callers on the
    /// dispatcher task, which must not wait on its own queue. `Full` when
    /// the bus has no room.
    pub fn try_send_to_app(&self, element_id: u16, element_type: ElementType, func: u16, payload: &[u8]) -> Result<()> {
        let env = self.element_envelope("to app", element_id, element_type, func, payload)?;
        self.bus.try_publish(Code::ToApp, api::DATA, &env)
    }

    pub fn try_send_to_element(&self, element_id: u16, element_type: ElementType, func: u16, payload: &[u8]) -> Result<()> {
        let env = self.element_envelope("to element", element_id, element_type, func, payload)?;
        self.bus.try_publish(Code::ToMeshx, api::DATA, &env)
    }

    pub fn try_send_ctrl_to_app(&self, evt: u16, payload: &[u8]) -> Result<()> {
        let env = pack_ctrl(evt, payload)?;
        self.bus.try_publish(Code::ToApp, api::CTRL, &env)
    }

    fn element_envelope(
        &self,
        dir: &str,
        element_id: u16,
        element_type: ElementType,
        func: u16,
        payload: &[u8],
    ) -> Result<Bytes> {
        let env = pack_element((element_id, element_type.as_u16(), func), payload)?;
        trace!("{} el={} type={} func={} [{}]", dir, element_id, element_type, func, hex_preview(payload));
        Ok(env)
    }

    fn handler(&self) -> HandlerRef<C> {
        let slots = self.slots.clone();
        Arc::new(move |_: &C, evt: EventMask, payload: &[u8]| -> Result<()> {
            route(&slots, evt, payload)
        })
    }

    pub fn reg_element_callback(&self, cb: DataCallback) -> Result<()> {
        let subscribe = {
            let mut slots = lock(&self.slots);
            slots.data = Some(cb);
            !std::mem::replace(&mut slots.data_subscribed, true)
        };
        if subscribe {
            if let Err(e) = self.bus.subscribe(Code::ToApp, api::DATA, self.handler()) {
                lock(&self.slots).data_subscribed = false;
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn reg_system_callback(&self, cb: CtrlCallback) -> Result<()> {
        let subscribe = {
            let mut slots = lock(&self.slots);
            slots.ctrl = Some(cb);
            !std::mem::replace(&mut slots.ctrl_subscribed, true)
        };
        if subscribe {
            if let Err(e) = self.bus.subscribe(Code::ToApp, api::CTRL, self.handler()) {
                lock(&self.slots).ctrl_subscribed = false;
                return Err(e);
            }
        }
        Ok(())
    }
}

fn route(slots: &Mutex<Slots>, evt: EventMask, payload: &[u8]) -> Result<()> {
    let (data, ctrl) = {
        let s = lock(slots);
        (s.data.clone(), s.ctrl.clone())
    };
    if evt & api::DATA != 0 {
        match data {
            Some(cb) => {
                let (hdr, body) = unpack_element(payload)?;
                cb(&hdr, body)?;
            }
            None => debug!("element envelope dropped, no app callback"),
        }
    }
    if evt & api::CTRL != 0 {
        match ctrl {
            Some(cb) => {
                let (hdr, body) = unpack_ctrl(payload)?;
                cb(&hdr, body)?;
            }
            None => debug!("control envelope dropped, no app callback"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_region_is_sized_to_largest_variant() {
        assert!(RelayServerEvt::LEN <= PAYLOAD_MAX);
        assert!(RelayClientEvt::LEN <= PAYLOAD_MAX);
        assert!(CwwwClientEvt::LEN <= PAYLOAD_MAX);
        assert!(RelayClientReq::LEN <= PAYLOAD_MAX);
        assert_eq!(CwwwClientReq::LEN, PAYLOAD_MAX);
    }

    #[test]
    fn element_envelope_layout() {
        let env = pack_element((2, 0, func_id::ONOFF), &[1]).unwrap();
        assert_eq!(env.len(), ENVELOPE_LEN);
        assert_eq!(&env[..9], &[2, 0, 0, 0, 0, 0, 1, 0, 1]);
        let (hdr, body) = unpack_element(&env).unwrap();
        assert_eq!(hdr.element_id, 2);
        assert_eq!(hdr.msg_len, 1);
        assert_eq!(body, &[1]);
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let big = [0u8; PAYLOAD_MAX + 1];
        assert!(matches!(pack_element((0, 0, 0), &big), Err(MeshxError::InvalidArg(_))));
        assert!(pack_element((0, 0, 0), &[0u8; PAYLOAD_MAX]).is_ok());
    }

    #[test]
    fn corrupt_msg_len_is_rejected() {
        let mut env = pack_element((1, 1, 0), &[0, 1]).unwrap().to_vec();
        env[6] = 0xFF;
        assert!(unpack_element(&env).is_err());
    }

    #[test]
    fn cwww_request_fields_are_little_endian() {
        let req = CwwwClientReq {
            set_get: 0,
            ack: 1,
            arg_bmap: 0x0E,
            on_off: 1,
            ctl: CtlFields {
                lightness: 0x8000,
                temperature: 0x1F40,
                ..CtlFields::default()
            },
        };
        let raw = req.to_bytes();
        assert_eq!(&raw[4..8], &[0x00, 0x80, 0x40, 0x1F]);
        assert_eq!(CwwwClientReq::from_bytes(&raw).unwrap(), req);
    }

    #[test]
    fn ctrl_envelope_carries_event() {
        let env = pack_ctrl(0x0080, &[1, 2, 3, 4]).unwrap();
        let (hdr, body) = unpack_ctrl(&env).unwrap();
        assert_eq!(hdr.evt, 0x0080);
        assert_eq!(&body[..4], &[1, 2, 3, 4]);
    }
}
