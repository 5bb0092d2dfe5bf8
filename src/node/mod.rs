//! Node lifecycle.
//!
//! [`MeshxNode::start`] brings the core up in a fixed order and returns a
//! running node. The shared services live in [`Device`], which every bus
//! handler receives. Bring-up order:
//!
//! ```text
//!  1 platform init (erase + retry once on NoFreePages)
//!  2 timer service          7 bluetooth controller
//!  3 NVS facade             8 restore meshx_store
//!  4 control bus task       9 element composition
//!  5 boot timer            10 mesh stack + device name
//!  6 app callbacks         11 provisioning on ADV|GATT
//!                          12 test console (optional)
//! ```
//!
//! A failure in steps 1-11 aborts start-up; nothing already brought up is
//! torn down.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{ApiBoundary, CtrlCallback, DataCallback};
use crate::composition::{Composition, CompositionBuilder};
use crate::config::Config;
use crate::console::Console;
use crate::control::{
    frm_ble, start_dispatcher, system, Code, ControlBus, DispatcherHandle, EventMask, HandlerRef,
};
use crate::elements::{factory_for, ElementBlock, ElementSnapshot};
use crate::error::{MeshxError, Result};
use crate::logutil::escape_log;
use crate::models::{encode, provisioning};
use crate::nvs::Nvs;
use crate::os::{OsTimer, TimerCallback, TimerService};
use crate::port::{addr, bearer, Capability, Ingress, MeshPort, PortEvent, ProvisioningDescriptor};
use crate::txcm::TxControl;

/// NVS key of the persisted device state.
pub const MESHX_STORE_KEY: &str = "meshx_store";
pub const BOOT_TIMER_NAME: &str = "boot_timer";

/// Device state that survives a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshxStore {
    pub net_key_id: u16,
    pub node_addr: u16,
}

/// Application hooks, the programmatic half of the configuration.
#[derive(Default, Clone)]
pub struct NodeCallbacks {
    pub data: Option<DataCallback>,
    pub ctrl: Option<CtrlCallback>,
}

/// Services shared by every handler on the control bus.
pub struct Device {
    pub config: Config,
    pub bus: Arc<ControlBus<Device>>,
    pub api: ApiBoundary<Device>,
    pub nvs: Nvs,
    pub port: Arc<dyn MeshPort>,
    pub timers: TimerService,
    pub txcm: TxControl,
    store: Mutex<MeshxStore>,
    composition: RwLock<Option<Composition>>,
    elements: RwLock<Vec<Arc<ElementBlock>>>,
}

impl Device {
    fn lock_store(&self) -> MutexGuard<'_, MeshxStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> MeshxStore {
        *self.lock_store()
    }

    pub fn set_store(&self, store: MeshxStore) {
        *self.lock_store() = store;
    }

    pub fn net_key_id(&self) -> u16 {
        self.lock_store().net_key_id
    }

    /// Primary unicast address, `UNASSIGNED` until provisioned.
    pub fn node_addr(&self) -> u16 {
        self.lock_store().node_addr
    }

    pub fn is_provisioned(&self) -> bool {
        !addr::is_unassigned(self.node_addr())
    }

    /// Run `f` on the composition; `None` before it is built.
    pub fn with_composition<R>(&self, f: impl FnOnce(&mut Composition) -> R) -> Option<R> {
        let mut comp = self.composition.write().unwrap_or_else(|e| e.into_inner());
        comp.as_mut().map(f)
    }

    pub fn composition(&self) -> Option<Composition> {
        self.composition
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn elements(&self) -> Vec<Arc<ElementBlock>> {
        self.elements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn element_snapshots(&self) -> Vec<ElementSnapshot> {
        let mut all: Vec<ElementSnapshot> = self
            .elements()
            .iter()
            .flat_map(|b| b.snapshot())
            .collect();
        all.sort_by_key(|s| s.element_id);
        all
    }
}

/// Map a port event to the bus message it becomes.
pub fn route_port_event(event: &PortEvent) -> Result<(Code, EventMask, Vec<u8>)> {
    let routed = match event {
        PortEvent::GenServer(e) => (Code::FrmBle, frm_ble::GEN_ONOFF_SRV, encode(e)?),
        PortEvent::LightServer(e) => (Code::FrmBle, frm_ble::LIGHT_CTL_SRV, encode(e)?),
        PortEvent::GenClient(e) => (Code::FrmBle, frm_ble::GEN_ONOFF_CLI, encode(e)?),
        PortEvent::LightClient(e) => (Code::FrmBle, frm_ble::LIGHT_CTL_CLI, encode(e)?),
        PortEvent::Config { evt, event } => {
            if *evt == 0 || evt & !frm_ble::CONFIG_SERVER != 0 {
                return Err(MeshxError::invalid_arg(format!("config server event 0x{:x}", evt)));
            }
            (Code::FrmBle, *evt, encode(event)?)
        }
        PortEvent::Provisioning { evt, event } => {
            if *evt == 0 || evt & !system::PROVISIONING != 0 {
                return Err(MeshxError::invalid_arg(format!("provisioning event 0x{:x}", evt)));
            }
            (Code::System, *evt, encode(event)?)
        }
    };
    Ok(routed)
}

type Routed = (Code, EventMask, Vec<u8>);

/// Ports report from their own context and must not block there. Routed
/// events go through an unbounded channel to one task that waits for room
/// on the bus, so a burst is neither dropped nor reordered.
fn start_ingress(bus: &Arc<ControlBus<Device>>) -> (Ingress, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Routed>();
    let bus = Arc::downgrade(bus);
    let forwarder = tokio::spawn(async move {
        while let Some((code, evt, payload)) = rx.recv().await {
            let Some(bus) = bus.upgrade() else { break };
            if let Err(e) = bus.publish(code, evt, &payload).await {
                warn!("port event {} evt=0x{:x} dropped: {}", code, evt, e);
            }
        }
        debug!("port ingress stopped");
    });
    let ingress: Ingress = Arc::new(move |event: PortEvent| -> Result<()> {
        let routed = route_port_event(&event)?;
        tx.send(routed)
            .map_err(|_| MeshxError::invalid_state("port ingress closed"))
    });
    (ingress, forwarder)
}

fn platform_init(port: &dyn MeshPort) -> Result<()> {
    match port.platform_init() {
        Err(MeshxError::NoFreePages) => {
            warn!("platform storage has no free pages, erasing");
            port.platform_erase()?;
            port.platform_init()
        }
        other => other,
    }
}

fn restore_store(nvs: &Nvs) -> MeshxStore {
    match nvs.get_value::<MeshxStore>(MESHX_STORE_KEY) {
        Ok(store) => {
            info!(
                "restored node state: addr=0x{:04x} net_key=0x{:03x}",
                store.node_addr, store.net_key_id
            );
            store
        }
        Err(MeshxError::NotFound(_)) => {
            debug!("no stored node state, starting unprovisioned");
            MeshxStore::default()
        }
        Err(e) => {
            warn!("stored node state unreadable ({}), starting unprovisioned", e);
            MeshxStore::default()
        }
    }
}

fn build_composition(dev: &Device) -> Result<Composition> {
    let cfg = &dev.config;
    let mut builder = CompositionBuilder::new(
        cfg.device.cid,
        cfg.device.pid,
        cfg.device.vid,
        cfg.composition.max_element_count,
    )?;
    let mut blocks = Vec::with_capacity(cfg.composition.elements.len());
    for entry in &cfg.composition.elements {
        let factory = factory_for(entry.element_type);
        blocks.push(factory.create(dev, &mut builder, entry.count)?);
    }
    let handler: HandlerRef<Device> = Arc::new(|dev: &Device, evt: EventMask, payload: &[u8]| -> Result<()> {
        provisioning::on_system_event(dev, evt, payload)
    });
    dev.bus.subscribe(Code::System, provisioning::HANDLED, handler)?;

    let mut comp = builder.finalize()?;
    let node_addr = dev.node_addr();
    if !addr::is_unassigned(node_addr) {
        comp.assign_addresses(node_addr);
    }
    *dev.elements.write().unwrap_or_else(|e| e.into_inner()) = blocks;
    Ok(comp)
}

fn print_banner(config: &Config, comp: &Composition) {
    info!("==============================");
    info!("  MeshX node v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "  product '{}' cid=0x{:04x} pid=0x{:04x}",
        escape_log(&config.device.product_name),
        config.device.cid,
        config.device.pid
    );
    info!("  {} element(s), uuid {}", comp.element_count(), config.device.uuid);
    info!("==============================");
}

/// A running node.
pub struct MeshxNode {
    dev: Arc<Device>,
    dispatcher: Option<DispatcherHandle>,
    ingress: JoinHandle<()>,
    boot_timer: OsTimer,
    console: Option<Mutex<Console>>,
}

impl MeshxNode {
    /// Bring the node up. Must be called from within a tokio runtime.
    pub fn start(config: Config, port: Arc<dyn MeshPort>, callbacks: NodeCallbacks) -> Result<Self> {
        platform_init(port.as_ref())?;

        let timers = TimerService::new();

        let nvs = Nvs::init(PathBuf::from(&config.nvs.data_dir), timers.clone())?;

        let bus = Arc::new(ControlBus::new(
            config.control.queue_depth,
            config.control.max_payload,
        )?);
        let txcm = TxControl::new(config.txcm.queue_depth, config.txcm.max_retries)?;
        let dev = Arc::new(Device {
            api: ApiBoundary::new(bus.clone()),
            bus: bus.clone(),
            nvs,
            port: port.clone(),
            timers: timers.clone(),
            txcm,
            store: Mutex::new(MeshxStore::default()),
            composition: RwLock::new(None),
            elements: RwLock::new(Vec::new()),
            config,
        });
        let dispatcher = start_dispatcher(bus.clone(), dev.clone());

        let boot_bus = Arc::downgrade(&bus);
        let on_boot: TimerCallback = Arc::new(move |name: &str| {
            let Some(bus) = boot_bus.upgrade() else { return };
            match bus.try_publish(Code::System, system::FRESH_BOOT, &[]) {
                Ok(()) => debug!("{} fired, fresh boot", name),
                Err(e) => warn!("{}: fresh boot not published: {}", name, e),
            }
        });
        let boot_timer = timers.create(
            BOOT_TIMER_NAME,
            Duration::from_millis(dev.config.boot.fresh_boot_timeout_ms),
            false,
            on_boot,
        )?;
        boot_timer.start()?;

        if let Some(cb) = callbacks.data {
            dev.api.reg_element_callback(cb)?;
        }
        if let Some(cb) = callbacks.ctrl {
            dev.api.reg_system_callback(cb)?;
        }

        port.bt_init()?;

        dev.nvs.open(
            dev.config.device.cid,
            dev.config.device.pid,
            dev.config.nvs.save_period_ms,
        )?;
        dev.set_store(restore_store(&dev.nvs));

        let comp = build_composition(&dev)?;

        let (ingress, forwarder) = start_ingress(&bus);
        for cap in [
            Capability::GenericServer,
            Capability::LightingServer,
            Capability::GenericClient,
            Capability::LightingClient,
            Capability::ConfigServer,
            Capability::Provisioning,
        ] {
            port.register_callback(cap, ingress.clone())?;
        }
        let prov = ProvisioningDescriptor {
            uuid: dev.config.device.uuid.into_bytes(),
            output_size: 0,
            output_actions: 0,
        };
        port.stack_init(&prov, &comp)?;
        port.set_device_name(&dev.config.device.product_name)?;
        print_banner(&dev.config, &comp);
        *dev.composition.write().unwrap_or_else(|e| e.into_inner()) = Some(comp);

        port.enable_provisioning(bearer::ADV | bearer::GATT)?;

        let console = if dev.config.console.enabled {
            info!("unit-test console enabled");
            Some(Mutex::new(Console::new(dev.clone())))
        } else {
            None
        };

        Ok(Self {
            dev,
            dispatcher: Some(dispatcher),
            ingress: forwarder,
            boot_timer,
            console,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    pub fn bus(&self) -> &Arc<ControlBus<Device>> {
        &self.dev.bus
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.as_ref().map(|d| d.is_running()).unwrap_or(false)
    }

    pub fn has_console(&self) -> bool {
        self.console.is_some()
    }

    /// Run one `ut …` console line.
    pub fn console_exec(&self, line: &str) -> Result<String> {
        let console = self
            .console
            .as_ref()
            .ok_or_else(|| MeshxError::invalid_state("console not enabled"))?;
        let mut console = console.lock().unwrap_or_else(|e| e.into_inner());
        console.execute(line)
    }

    /// Stop the dispatcher, flush and close the store.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Err(e) = self.boot_timer.delete() {
            debug!("boot timer already gone: {}", e);
        }
        self.ingress.abort();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }
        self.dev.bus.close();
        if self.dev.nvs.is_open() {
            self.dev.nvs.commit()?;
            self.dev.nvs.close()?;
        }
        info!("node stopped");
        Ok(())
    }
}
