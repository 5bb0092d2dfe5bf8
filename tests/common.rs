//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use meshx::api::{CtrlCallback, CtrlMsgHeader, DataCallback, ElementMsgHeader};
use meshx::config::Config;
use meshx::control::{Code, EventMask, HandlerRef};
use meshx::node::{Device, MeshxNode, NodeCallbacks};
use meshx::port::sim::SimPort;

/// Primary address handed out by `provision`.
pub const NODE_ADDR: u16 = 0x0005;

/// Config rooted in `dir` with the fresh-boot timer pushed out of the way.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.nvs.data_dir = dir.join("nvs").to_string_lossy().into_owned();
    config.nvs.save_period_ms = 50;
    config.boot.fresh_boot_timeout_ms = 60_000;
    config.logging.file = None;
    config
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    pub header: ElementMsgHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCtrl {
    pub header: CtrlMsgHeader,
    pub payload: Vec<u8>,
}

pub struct AppSink {
    pub data: mpsc::UnboundedReceiver<AppData>,
    pub ctrl: mpsc::UnboundedReceiver<AppCtrl>,
}

/// Callbacks that forward every application envelope into channels.
pub fn app_sink() -> (NodeCallbacks, AppSink) {
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let data: DataCallback = Arc::new(move |hdr: &ElementMsgHeader, payload: &[u8]| -> meshx::Result<()> {
        let _ = data_tx.send(AppData {
            header: *hdr,
            payload: payload.to_vec(),
        });
        Ok(())
    });
    let ctrl: CtrlCallback = Arc::new(move |hdr: &CtrlMsgHeader, payload: &[u8]| -> meshx::Result<()> {
        let _ = ctrl_tx.send(AppCtrl {
            header: *hdr,
            payload: payload.to_vec(),
        });
        Ok(())
    });
    (
        NodeCallbacks {
            data: Some(data),
            ctrl: Some(ctrl),
        },
        AppSink {
            data: data_rx,
            ctrl: ctrl_rx,
        },
    )
}

pub struct TestNode {
    pub node: MeshxNode,
    pub port: Arc<SimPort>,
    pub sink: AppSink,
}

impl TestNode {
    pub fn dev(&self) -> &Arc<Device> {
        self.node.device()
    }
}

pub fn start_node(config: Config) -> TestNode {
    let port = Arc::new(SimPort::new());
    let (callbacks, sink) = app_sink();
    let node = MeshxNode::start(config, port.clone(), callbacks).expect("node start");
    TestNode { node, port, sink }
}

/// Recording bus tap: every message under `code` matching `mask`.
pub fn tap(dev: &Device, code: Code, mask: EventMask) -> mpsc::UnboundedReceiver<(EventMask, Vec<u8>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: HandlerRef<Device> = Arc::new(move |_: &Device, evt: EventMask, payload: &[u8]| -> meshx::Result<()> {
        let _ = tx.send((evt, payload.to_vec()));
        Ok(())
    });
    dev.bus.subscribe(code, mask, handler).expect("tap subscribe");
    rx
}

pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, ms: u64) -> T {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

/// Assert nothing arrives within `ms`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, ms: u64) {
    if let Ok(Some(v)) = tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await {
        panic!("unexpected message {:?}", v);
    }
}

/// Wait until the bus queue is drained and the dispatcher is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

/// Provision the node at `NODE_ADDR` and wait for the app notification.
pub async fn provision(t: &mut TestNode) {
    t.port.complete_provisioning(0, NODE_ADDR).expect("inject provisioning");
    let ctrl = recv_within(&mut t.sink.ctrl, 500).await;
    assert_eq!(u32::from(ctrl.header.evt), meshx::control::system::PROV_COMPLETE);
}
