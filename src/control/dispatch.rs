//! Control bus and its dispatcher task.
//!
//! Producers (mesh-stack callbacks, timer callbacks, the application, bus
//! handlers themselves) publish envelopes into one bounded queue. A single
//! dispatcher task drains it and calls every registration whose mask
//! intersects the message's events. The payload copy belongs to the
//! dispatcher and is released as soon as the last handler returns.
//!
//! Handlers run on the dispatcher task, so they must never wait on the bus
//! queue; they publish with [`ControlBus::try_publish`], and whatever they
//! publish is seen on a later loop iteration, never within the current
//! dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace, warn};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::codes::{Code, EventMask};
use super::registry::{HandlerRef, Registry};
use crate::error::{MeshxError, Result};
use crate::logutil::hex_preview;
use crate::os::MessageQueue;

pub const DEFAULT_QUEUE_DEPTH: usize = 10;
pub const DEFAULT_MAX_PAYLOAD: usize = 64;

/// Bus-internal envelope.
#[derive(Debug, Clone)]
pub struct ControlMsg {
    pub code: Code,
    pub events: EventMask,
    pub payload: Option<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub queued: usize,
    pub published: u64,
    pub dispatched: u64,
    pub unmatched: u64,
    pub handler_errors: u64,
    pub payloads_allocated: u64,
    pub payloads_freed: u64,
    pub payload_bytes_freed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    unmatched: AtomicU64,
    handler_errors: AtomicU64,
    payloads_allocated: AtomicU64,
    payloads_freed: AtomicU64,
    payload_bytes_freed: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Code-keyed event bus over a bounded queue. `C` is the context handed to
/// every handler.
pub struct ControlBus<C> {
    registry: Registry<C>,
    queue: MessageQueue<ControlMsg>,
    max_payload: usize,
    counters: Counters,
}

impl<C> ControlBus<C> {
    pub fn new(queue_depth: usize, max_payload: usize) -> Result<Self> {
        Ok(Self {
            registry: Registry::default(),
            queue: MessageQueue::create(queue_depth)?,
            max_payload,
            counters: Counters::default(),
        })
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn subscribe(&self, code: Code, mask: EventMask, handler: HandlerRef<C>) -> Result<()> {
        self.registry.subscribe(code, mask, handler)
    }

    pub fn unsubscribe(&self, code: Code, mask: EventMask, handler: &HandlerRef<C>) -> Result<()> {
        self.registry.unsubscribe(code, mask, handler)
    }

    pub fn subscriber_count(&self, code: Code) -> usize {
        self.registry.count(code)
    }

    fn envelope(&self, code: Code, events: EventMask, payload: &[u8]) -> Result<ControlMsg> {
        if payload.len() > self.max_payload {
            return Err(MeshxError::invalid_arg(format!(
                "{} byte payload exceeds the {} byte slot",
                payload.len(),
                self.max_payload
            )));
        }
        let payload = if payload.is_empty() {
            None
        } else {
            bump(&self.counters.payloads_allocated, 1);
            Some(Bytes::copy_from_slice(payload))
        };
        Ok(ControlMsg {
            code,
            events,
            payload,
        })
    }

    fn note_published(&self, msg: &ControlMsg) {
        bump(&self.counters.published, 1);
        trace!(
            target: "meshx::bus",
            "publish {} evt=0x{:x} payload={}",
            msg.code,
            msg.events,
            msg.payload.as_deref().map(hex_preview).unwrap_or_default()
        );
    }

    /// Publish a copy of `payload`, waiting as long as it takes for a slot.
    pub async fn publish(&self, code: Code, events: EventMask, payload: &[u8]) -> Result<()> {
        let msg = self.envelope(code, events, payload)?;
        let allocated = msg.payload.is_some();
        match self.queue.send(msg.clone(), None).await {
            Ok(()) => {
                self.note_published(&msg);
                Ok(())
            }
            Err(e) => {
                if allocated {
                    bump(&self.counters.payloads_freed, 1);
                }
                Err(e)
            }
        }
    }

    /// Publish without waiting; `Full` when the queue has no free slot.
    pub fn try_publish(&self, code: Code, events: EventMask, payload: &[u8]) -> Result<()> {
        let msg = self.envelope(code, events, payload)?;
        let allocated = msg.payload.is_some();
        match self.queue.try_send(msg.clone()) {
            Ok(()) => {
                self.note_published(&msg);
                Ok(())
            }
            Err(e) => {
                if allocated {
                    bump(&self.counters.payloads_freed, 1);
                }
                Err(e)
            }
        }
    }

    /// Serialize `value` with bincode and publish it without waiting.
    pub fn try_publish_value<T: Serialize>(&self, code: Code, events: EventMask, value: &T) -> Result<()> {
        let payload = bincode::serialize(value)?;
        self.try_publish(code, events, &payload)
    }

    /// Serialize `value` with bincode and publish it, waiting for a slot.
    pub async fn publish_value<T: Serialize>(&self, code: Code, events: EventMask, value: &T) -> Result<()> {
        let payload = bincode::serialize(value)?;
        self.publish(code, events, &payload).await
    }

    /// Deliver one message to every matching registration and release its
    /// payload. Returns the number of handlers invoked.
    pub fn dispatch(&self, ctx: &C, msg: ControlMsg) -> usize {
        let ControlMsg {
            code,
            events,
            payload,
        } = msg;

        if self.registry.count(code) == 0 {
            warn!(target: "meshx::bus", "no subscribers registered under {}", code);
        }
        let handlers = self.registry.matching(code, events);
        if handlers.is_empty() {
            debug!(target: "meshx::bus", "{} evt=0x{:x} matched no handler", code, events);
            bump(&self.counters.unmatched, 1);
        }

        let bytes: &[u8] = payload.as_deref().unwrap_or(&[]);
        for handler in &handlers {
            if let Err(e) = handler.on_event(ctx, events, bytes) {
                warn!(target: "meshx::bus", "handler for {} evt=0x{:x} failed: {}", code, events, e);
                bump(&self.counters.handler_errors, 1);
            }
        }
        bump(&self.counters.dispatched, 1);

        if let Some(p) = payload {
            bump(&self.counters.payloads_freed, 1);
            bump(&self.counters.payload_bytes_freed, p.len() as u64);
            drop(p);
        }
        handlers.len()
    }

    /// Take one message off the queue without waiting, if any.
    pub fn try_next(&self) -> Result<ControlMsg> {
        self.queue.try_recv()
    }

    /// Stop accepting messages and drop anything still queued.
    pub fn close(&self) {
        self.queue.delete();
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.counters;
        BusStats {
            queued: self.queue.len(),
            published: c.published.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            payloads_allocated: c.payloads_allocated.load(Ordering::Relaxed),
            payloads_freed: c.payloads_freed.load(Ordering::Relaxed),
            payload_bytes_freed: c.payload_bytes_freed.load(Ordering::Relaxed),
        }
    }
}

/// Owns the dispatcher task.
pub struct DispatcherHandle {
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn is_running(&self) -> bool {
        self.join.as_ref().map(|j| !j.is_finished()).unwrap_or(false)
    }

    /// Ask the dispatcher to stop after the message it is handling, and wait
    /// for it.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(target: "meshx::bus", "dispatcher task ended abnormally: {}", e);
            }
        }
    }
}

/// Spawn the single consumer for `bus`, handing `ctx` to every handler.
pub fn start_dispatcher<C>(bus: Arc<ControlBus<C>>, ctx: Arc<C>) -> DispatcherHandle
where
    C: Send + Sync + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        debug!(target: "meshx::bus", "meshx_control_task started");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                next = bus.queue.recv(None) => match next {
                    Ok(msg) => {
                        bus.dispatch(&ctx, msg);
                    }
                    Err(e) => {
                        debug!(target: "meshx::bus", "control queue closed: {}", e);
                        break;
                    }
                }
            }
        }
        debug!(target: "meshx::bus", "meshx_control_task stopped");
    });
    DispatcherHandle {
        stop: Some(stop_tx),
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn payload_at_slot_size_is_accepted_and_larger_rejected() {
        let bus = ControlBus::<()>::new(4, 8).unwrap();
        assert!(bus.try_publish(Code::System, 1, &[0u8; 8]).is_ok());
        assert!(matches!(
            bus.try_publish(Code::System, 1, &[0u8; 9]),
            Err(MeshxError::InvalidArg(_))
        ));
    }

    #[test]
    fn dispatch_calls_only_intersecting_masks_with_full_event() {
        let bus = ControlBus::<()>::new(4, 16).unwrap();
        let seen: Arc<Mutex<Vec<(&'static str, EventMask)>>> = Arc::default();

        let a = seen.clone();
        bus.subscribe(
            Code::ToHal,
            0b001,
            Arc::new(move |_: &(), evt: EventMask, _: &[u8]| -> Result<()> {
                a.lock().unwrap().push(("a", evt));
                Ok(())
            }),
        )
        .unwrap();
        let b = seen.clone();
        bus.subscribe(
            Code::ToHal,
            0b100,
            Arc::new(move |_: &(), evt: EventMask, _: &[u8]| -> Result<()> {
                b.lock().unwrap().push(("b", evt));
                Ok(())
            }),
        )
        .unwrap();

        bus.try_publish(Code::ToHal, 0b011, &[1]).unwrap();
        let msg = bus.try_next().unwrap();
        assert_eq!(bus.dispatch(&(), msg), 1);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 0b011)]);
    }

    #[test]
    fn failing_handler_does_not_stop_later_subscribers() {
        let bus = ControlBus::<()>::new(4, 16).unwrap();
        let hits = Arc::new(AtomicU64::new(0));
        bus.subscribe(
            Code::System,
            1,
            Arc::new(|_: &(), _: EventMask, _: &[u8]| -> Result<()> {
                Err(MeshxError::Fail("boom".into()))
            }),
        )
        .unwrap();
        let h = hits.clone();
        bus.subscribe(
            Code::System,
            1,
            Arc::new(move |_: &(), _: EventMask, _: &[u8]| -> Result<()> {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        bus.try_publish(Code::System, 1, &[]).unwrap();
        let msg = bus.try_next().unwrap();
        bus.dispatch(&(), msg);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_errors, 1);
    }

    #[test]
    fn empty_payload_allocates_nothing() {
        let bus = ControlBus::<()>::new(2, 16).unwrap();
        bus.try_publish(Code::System, 1, &[]).unwrap();
        let msg = bus.try_next().unwrap();
        assert!(msg.payload.is_none());
        bus.dispatch(&(), msg);
        let stats = bus.stats();
        assert_eq!(stats.payloads_allocated, 0);
        assert_eq!(stats.payloads_freed, 0);
    }
}
