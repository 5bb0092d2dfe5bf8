//! Element library.
//!
//! One factory per [`ElementType`]. A factory reserves element slots in the
//! composition, attaches its model vector to every slot, restores each
//! instance's persisted context and subscribes its handlers on the bus. The
//! per-instance state lives in an [`ElementBlock`] that only the dispatcher
//! task mutates.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::composition::{CompositionBuilder, ElementType, Model, Placement};
use crate::control::{frm_ble, Code, EventMask, HandlerRef};
use crate::error::{MeshxError, Result};
use crate::models::{config_server, decode};
use crate::node::Device;
use crate::port::{addr, ClientEvt, ConfigServerEvent, LightCtlParams};
use crate::txcm::TimeoutAction;

pub mod cwww_client;
pub mod cwww_server;
pub mod relay_client;
pub mod relay_server;

/// Persisted per-element context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementCtx {
    pub on_off: u8,
    pub ctl: LightCtlParams,
    pub ctl_default: LightCtlParams,
    pub pub_addr: u16,
    pub app_id: u16,
    pub tid: u8,
}

impl Default for ElementCtx {
    fn default() -> Self {
        Self {
            on_off: 0,
            ctl: LightCtlParams::default(),
            ctl_default: LightCtlParams::default(),
            pub_addr: addr::UNASSIGNED,
            app_id: 0,
            tid: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementSnapshot {
    pub element_id: u16,
    pub element_type: ElementType,
    pub ctx: ElementCtx,
}

/// State of every instance of one element type.
pub struct ElementBlock {
    element_type: ElementType,
    placement: Placement,
    ctxs: Mutex<Vec<ElementCtx>>,
}

impl ElementBlock {
    fn new(placement: Placement, ctxs: Vec<ElementCtx>) -> Self {
        Self {
            element_type: placement.element_type,
            placement,
            ctxs: Mutex::new(ctxs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ElementCtx>> {
        self.ctxs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn element_ids(&self) -> Vec<u16> {
        self.placement.elements.iter().map(|e| *e as u16).collect()
    }

    pub fn contains(&self, element_id: u16) -> bool {
        self.instance_of(element_id).is_some()
    }

    fn instance_of(&self, element_id: u16) -> Option<usize> {
        self.placement
            .elements
            .iter()
            .position(|e| *e == usize::from(element_id))
    }

    pub fn ctx(&self, element_id: u16) -> Option<ElementCtx> {
        let idx = self.instance_of(element_id)?;
        self.lock().get(idx).copied()
    }

    /// Run `f` on the context of `element_id`; `None` when out of range.
    pub fn with_ctx<R>(&self, element_id: u16, f: impl FnOnce(&mut ElementCtx) -> R) -> Option<R> {
        let idx = self.instance_of(element_id)?;
        let mut ctxs = self.lock();
        ctxs.get_mut(idx).map(f)
    }

    pub fn snapshot(&self) -> Vec<ElementSnapshot> {
        let ctxs = self.lock();
        self.placement
            .elements
            .iter()
            .zip(ctxs.iter())
            .map(|(el, ctx)| ElementSnapshot {
                element_id: *el as u16,
                element_type: self.element_type,
                ctx: *ctx,
            })
            .collect()
    }

    /// Write the context of `element_id` through to NVS. Failures are
    /// logged; the in-memory state stays authoritative.
    pub fn persist(&self, dev: &Device, element_id: u16) {
        if let Some(ctx) = self.ctx(element_id) {
            if let Err(e) = dev.nvs.element_ctx_set(element_id, &ctx) {
                warn!("{}: saving context of element {} failed: {}", self.element_type, element_id, e);
            }
        }
    }

    /// Shared configuration server handling for every element type.
    pub fn on_config_server(&self, dev: &Device, evt: EventMask, payload: &[u8]) -> Result<()> {
        let ev: ConfigServerEvent = decode(payload)?;
        let element_id = match config_server::element_id(dev.node_addr(), &ev) {
            Some(id) if self.contains(id) => id,
            _ => return Ok(()),
        };
        let changed = self
            .with_ctx(element_id, |ctx| config_server::apply(evt, &ev, &mut ctx.pub_addr, &mut ctx.app_id))
            .unwrap_or(false);
        if changed {
            debug!("{}: element {} config updated", self.element_type, element_id);
            self.persist(dev, element_id);
        }
        Ok(())
    }
}

/// Builds one element type into the composition and onto the bus.
pub trait ElementFactory: Send + Sync {
    fn element_type(&self) -> ElementType;

    /// SIG models carried by every instance, in order.
    fn sig_models(&self) -> &'static [u16];

    /// Whether instance 0 may share the root element.
    fn supports_root_fold(&self) -> bool {
        false
    }

    fn subscribe(&self, dev: &Device, block: Arc<ElementBlock>) -> Result<()>;

    fn create(&self, dev: &Device, builder: &mut CompositionBuilder, count: usize) -> Result<Arc<ElementBlock>> {
        let placement = builder.place(self.element_type(), count, self.supports_root_fold())?;
        for (instance, el) in placement.elements.iter().enumerate() {
            for id in self.sig_models() {
                builder.add_model(*el, Model::sig(*id).with_user_data(self.element_type(), instance))?;
            }
        }

        let mut ctxs = Vec::new();
        ctxs.try_reserve_exact(count)
            .map_err(|_| MeshxError::NoMem(format!("{} contexts", self.element_type())))?;
        for el in &placement.elements {
            let ctx = match dev.nvs.element_ctx_get::<ElementCtx>(*el as u16) {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!("{}: no stored context for element {} ({}), using defaults", self.element_type(), el, e);
                    ElementCtx::default()
                }
            };
            ctxs.push(ctx);
        }

        debug!(
            "{}: {} instance(s) at elements {:?}{}",
            self.element_type(),
            count,
            placement.elements,
            if placement.folded { " (root folded)" } else { "" }
        );
        let block = Arc::new(ElementBlock::new(placement, ctxs));
        self.subscribe(dev, block.clone())?;
        Ok(block)
    }
}

pub fn factory_for(element_type: ElementType) -> Box<dyn ElementFactory> {
    match element_type {
        ElementType::RelayServer => Box::new(relay_server::RelayServerFactory),
        ElementType::RelayClient => Box::new(relay_client::RelayClientFactory),
        ElementType::CwwwServer => Box::new(cwww_server::CwwwServerFactory),
        ElementType::CwwwClient => Box::new(cwww_client::CwwwClientFactory),
    }
}

/// Subscribe `f` under `code`/`mask` with `block` captured.
pub(crate) fn subscribe_block<F>(dev: &Device, code: Code, mask: EventMask, block: &Arc<ElementBlock>, f: F) -> Result<()>
where
    F: Fn(&ElementBlock, &Device, EventMask, &[u8]) -> Result<()> + Send + Sync + 'static,
{
    let block = block.clone();
    let handler: HandlerRef<Device> = Arc::new(move |dev: &Device, evt: EventMask, payload: &[u8]| -> Result<()> {
        f(&block, dev, evt, payload)
    });
    dev.bus.subscribe(code, mask, handler)
}

pub(crate) fn subscribe_config_server(dev: &Device, block: &Arc<ElementBlock>) -> Result<()> {
    subscribe_block(
        dev,
        Code::FrmBle,
        frm_ble::CONFIG_SERVER,
        block,
        |b, dev, evt, payload| b.on_config_server(dev, evt, payload),
    )
}

/// Run a client model event past the transmit queue. Returns `false` when
/// the event was absorbed by a resend and must not be reported.
pub(crate) fn settle_client_event(dev: &Device, element_id: u16, evt: ClientEvt, src_addr: u16) -> bool {
    if evt != ClientEvt::Timeout {
        dev.txcm.on_status(dev.port.as_ref(), element_id, src_addr);
        return true;
    }
    match dev.txcm.on_timeout(dev.port.as_ref(), element_id) {
        TimeoutAction::Resent { attempt } => {
            debug!("client {}: no status yet, attempt {}", element_id, attempt);
            false
        }
        TimeoutAction::GaveUp(msg) => {
            warn!(
                "client {}: 0x{:04x} to 0x{:04x} timed out",
                element_id, msg.opcode, msg.ctx.dst_addr
            );
            true
        }
        TimeoutAction::Untracked => true,
    }
}
