use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshx::control::{start_dispatcher, Code, ControlBus, EventMask, HandlerRef};
use meshx::MeshxError;
use tokio::sync::mpsc;

fn recorder(tx: mpsc::UnboundedSender<(&'static str, EventMask, Vec<u8>)>, name: &'static str) -> HandlerRef<()> {
    Arc::new(move |_: &(), evt: EventMask, payload: &[u8]| -> meshx::Result<()> {
        let _ = tx.send((name, evt, payload.to_vec()));
        Ok(())
    })
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(&'static str, EventMask, Vec<u8>)>) -> (&'static str, EventMask, Vec<u8>) {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out")
        .expect("closed")
}

#[tokio::test]
async fn handlers_see_only_intersecting_events_in_publish_order() {
    let bus = Arc::new(ControlBus::<()>::new(8, 32).unwrap());
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(Code::FrmBle, 0b01, recorder(tx.clone(), "low")).unwrap();
    bus.subscribe(Code::FrmBle, 0b10, recorder(tx.clone(), "high")).unwrap();
    bus.subscribe(Code::ToHal, 0b01, recorder(tx, "hal")).unwrap();
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    bus.publish(Code::FrmBle, 0b01, &[1]).await.unwrap();
    bus.publish(Code::FrmBle, 0b10, &[2]).await.unwrap();
    bus.publish(Code::FrmBle, 0b11, &[3]).await.unwrap();

    assert_eq!(next(&mut rx).await, ("low", 0b01, vec![1]));
    assert_eq!(next(&mut rx).await, ("high", 0b10, vec![2]));
    assert_eq!(next(&mut rx).await, ("low", 0b11, vec![3]));
    assert_eq!(next(&mut rx).await, ("high", 0b11, vec![3]));
    assert!(rx.try_recv().is_err());
    handle.shutdown().await;
}

#[tokio::test]
async fn unsubscribed_handler_is_not_called_again() {
    let bus = Arc::new(ControlBus::<()>::new(8, 32).unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handler: HandlerRef<()> = Arc::new(move |_: &(), _: EventMask, _: &[u8]| -> meshx::Result<()> {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    bus.subscribe(Code::System, 1, handler.clone()).unwrap();
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    bus.publish(Code::System, 1, &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    bus.unsubscribe(Code::System, 1, &handler).unwrap();
    bus.publish(Code::System, 1, &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count(Code::System), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn every_published_payload_is_freed_once() {
    let bus = Arc::new(ControlBus::<()>::new(16, 32).unwrap());
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(Code::ToApp, 1, recorder(tx, "app")).unwrap();
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    let sizes = [1usize, 7, 32, 0, 12];
    for n in sizes {
        bus.publish(Code::ToApp, 1, &vec![0xAA; n]).await.unwrap();
    }
    // unmatched messages still release their payload
    bus.publish(Code::ToHal, 1, &[9; 5]).await.unwrap();
    for _ in sizes {
        next(&mut rx).await;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let stats = bus.stats();
    assert_eq!(stats.published, 6);
    assert_eq!(stats.dispatched, 6);
    assert_eq!(stats.unmatched, 1);
    assert_eq!(stats.payloads_allocated, 5);
    assert_eq!(stats.payloads_freed, 5);
    assert_eq!(stats.payload_bytes_freed, (1 + 7 + 32 + 12 + 5) as u64);
    handle.shutdown().await;
}

#[tokio::test]
async fn handler_publishing_during_dispatch_is_seen_after_it_returns() {
    let bus = Arc::new(ControlBus::<()>::new(8, 32).unwrap());
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let inner_bus = Arc::downgrade(&bus);
    let o = order.clone();
    let first: HandlerRef<()> = Arc::new(move |_: &(), _: EventMask, _: &[u8]| -> meshx::Result<()> {
        o.lock().unwrap().push("first:start");
        if let Some(bus) = inner_bus.upgrade() {
            bus.try_publish(Code::ElStateCh, 1, &[1])?;
        }
        o.lock().unwrap().push("first:end");
        Ok(())
    });
    let o = order.clone();
    let second: HandlerRef<()> = Arc::new(move |_: &(), _: EventMask, _: &[u8]| -> meshx::Result<()> {
        o.lock().unwrap().push("second");
        Ok(())
    });
    bus.subscribe(Code::FrmBle, 1, first).unwrap();
    bus.subscribe(Code::ElStateCh, 1, second).unwrap();
    let handle = start_dispatcher(bus.clone(), Arc::new(()));

    bus.publish(Code::FrmBle, 1, &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*order.lock().unwrap(), vec!["first:start", "first:end", "second"]);
    handle.shutdown().await;
}

#[tokio::test]
async fn invalid_registrations_and_oversized_payloads_are_rejected() {
    let bus = ControlBus::<()>::new(2, 16).unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        bus.subscribe(Code::System, 0, recorder(tx, "zero")),
        Err(MeshxError::InvalidArg(_))
    ));
    assert!(bus.publish(Code::System, 1, &[0; 16]).await.is_ok());
    assert!(matches!(
        bus.publish(Code::System, 1, &[0; 17]).await,
        Err(MeshxError::InvalidArg(_))
    ));
}

#[tokio::test]
async fn try_publish_on_full_queue_reports_full() {
    let bus = ControlBus::<()>::new(2, 16).unwrap();
    bus.try_publish(Code::System, 1, &[1]).unwrap();
    bus.try_publish(Code::System, 1, &[2]).unwrap();
    assert!(matches!(bus.try_publish(Code::System, 1, &[3]), Err(MeshxError::Full)));
    let stats = bus.stats();
    assert_eq!(stats.queued, 2);
    // the rejected copy is released immediately
    assert_eq!(stats.payloads_allocated - stats.payloads_freed, 2);
}

#[tokio::test]
async fn shutdown_stops_the_dispatcher() {
    let bus = Arc::new(ControlBus::<()>::new(4, 16).unwrap());
    let handle = start_dispatcher(bus.clone(), Arc::new(()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handle.is_running());
    handle.shutdown().await;
    bus.try_publish(Code::System, 1, &[]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bus.stats().dispatched, 0);
}
