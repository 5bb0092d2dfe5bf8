use std::sync::Arc;
use std::time::Duration;

use meshx::api::{
    func_id, ApiBoundary, ApiPayload, CtrlCallback, DataCallback, ElementMsgHeader, CtrlMsgHeader, RelayServerEvt,
    ENVELOPE_LEN, PAYLOAD_MAX,
};
use meshx::composition::ElementType;
use meshx::control::{api, start_dispatcher, Code, ControlBus, EventMask, HandlerRef};
use meshx::MeshxError;
use tokio::sync::mpsc;

fn bus() -> Arc<ControlBus<()>> {
    Arc::new(ControlBus::new(8, 64).unwrap())
}

fn data_into(tx: mpsc::UnboundedSender<(&'static str, ElementMsgHeader, Vec<u8>)>, tag: &'static str) -> DataCallback {
    Arc::new(move |hdr: &ElementMsgHeader, payload: &[u8]| -> meshx::Result<()> {
        let _ = tx.send((tag, *hdr, payload.to_vec()));
        Ok(())
    })
}

#[tokio::test]
async fn element_notification_reaches_the_data_callback() {
    let bus = bus();
    let boundary = ApiBoundary::new(bus.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    boundary.reg_element_callback(data_into(tx, "app")).unwrap();
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    let evt = RelayServerEvt { on_off: 1 };
    boundary
        .send_to_app(4, ElementType::RelayServer, func_id::ONOFF, &evt.to_bytes())
        .await
        .unwrap();

    let (_, hdr, payload) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        hdr,
        ElementMsgHeader {
            element_id: 4,
            element_type: ElementType::RelayServer.as_u16(),
            func_id: func_id::ONOFF,
            msg_len: 1,
        }
    );
    assert_eq!(payload, vec![1]);
    handle.shutdown().await;
}

#[tokio::test]
async fn reregistering_replaces_the_callback_without_a_second_subscription() {
    let bus = bus();
    let boundary = ApiBoundary::new(bus.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    boundary.reg_element_callback(data_into(tx.clone(), "first")).unwrap();
    boundary.reg_element_callback(data_into(tx, "second")).unwrap();
    assert_eq!(bus.subscriber_count(Code::ToApp), 1);
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    boundary
        .send_to_app(0, ElementType::RelayServer, func_id::ONOFF, &[0])
        .await
        .unwrap();
    let (tag, _, _) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, "second");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(rx.try_recv().is_err());
    handle.shutdown().await;
}

#[tokio::test]
async fn control_events_carry_the_whole_payload_region() {
    let bus = bus();
    let boundary = ApiBoundary::new(bus.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctrl: CtrlCallback = Arc::new(move |hdr: &CtrlMsgHeader, payload: &[u8]| -> meshx::Result<()> {
        let _ = tx.send((*hdr, payload.to_vec()));
        Ok(())
    });
    boundary.reg_system_callback(ctrl).unwrap();
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    boundary.send_ctrl_to_app(0x0080, &[0x05, 0x00]).await.unwrap();
    let (hdr, payload) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hdr.evt, 0x0080);
    assert_eq!(payload.len(), PAYLOAD_MAX);
    assert_eq!(&payload[..2], &[0x05, 0x00]);
    assert!(payload[2..].iter().all(|b| *b == 0));
    handle.shutdown().await;
}

#[tokio::test]
async fn application_requests_travel_as_fixed_size_envelopes() {
    let bus = bus();
    let boundary = ApiBoundary::new(bus.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sniff: HandlerRef<()> = Arc::new(move |_: &(), evt: EventMask, payload: &[u8]| -> meshx::Result<()> {
        let _ = tx.send((evt, payload.to_vec()));
        Ok(())
    });
    bus.subscribe(Code::ToMeshx, api::DATA, sniff).unwrap();
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    boundary
        .send_to_element(1, ElementType::RelayClient, func_id::ONOFF, &[0, 1, 1])
        .await
        .unwrap();
    let (evt, raw) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(evt, api::DATA);
    assert_eq!(raw.len(), ENVELOPE_LEN);
    let (hdr, body) = meshx::api::unpack_element(&raw).unwrap();
    assert_eq!(hdr.element_type, ElementType::RelayClient.as_u16());
    assert_eq!(body, &[0, 1, 1]);
    handle.shutdown().await;
}

#[tokio::test]
async fn oversized_payloads_never_reach_the_bus() {
    let bus = bus();
    let boundary = ApiBoundary::new(bus.clone());
    let err = boundary
        .send_to_app(0, ElementType::CwwwServer, func_id::CTL, &[0; PAYLOAD_MAX + 1])
        .await
        .unwrap_err();
    assert!(matches!(err, MeshxError::InvalidArg(_)));
    assert_eq!(bus.stats().published, 0);
}

#[tokio::test]
async fn a_burst_larger_than_the_queue_is_delivered_in_order() {
    let bus = bus();
    let boundary = Arc::new(ApiBoundary::new(bus.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    boundary.reg_element_callback(data_into(tx, "app")).unwrap();

    // nothing drains the bus yet, so the producer has to wait for room
    let producer = {
        let boundary = boundary.clone();
        tokio::spawn(async move {
            for id in 0..12u16 {
                boundary
                    .send_to_app(id, ElementType::RelayServer, func_id::ONOFF, &[1])
                    .await?;
            }
            Ok::<_, MeshxError>(())
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());
    assert!(matches!(
        boundary.try_send_to_app(99, ElementType::RelayServer, func_id::ONOFF, &[1]),
        Err(MeshxError::Full)
    ));

    let handle = start_dispatcher(bus.clone(), Arc::new(()));
    tokio::time::timeout(Duration::from_millis(500), producer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let mut ids = Vec::new();
    while ids.len() < 12 {
        let (_, hdr, _) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        ids.push(hdr.element_id);
    }
    assert_eq!(ids, (0..12).collect::<Vec<_>>());
    handle.shutdown().await;
}
