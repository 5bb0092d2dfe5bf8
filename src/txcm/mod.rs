//! Transmit control for client requests.
//!
//! Acknowledged requests to a unicast destination go through one FIFO and
//! are sent one at a time: the head entry is sent, put back at the front in
//! the waiting state and stays there until a status from its destination
//! arrives or its retry budget runs out. Unacknowledged requests and
//! requests to group, virtual or broadcast addresses expect no status; they
//! are sent when they reach the head and are not retained.
//!
//! ```text
//!  submit -> [New ... New] -> head sent -> WaitingAck
//!                                  |  status from dst   -> dropped, next head sent
//!                                  |  timeout, budget    -> resent from the front
//!                                  |  timeout, exhausted -> dropped, reported
//! ```
//!
//! Every call runs on the dispatcher task, so the head never changes between
//! a peek and the following receive.

use log::{debug, warn};

use crate::error::{MeshxError, Result};
use crate::os::MessageQueue;
use crate::port::{addr, opcode, MeshPort, ModelRef, MsgCtx};

/// One outbound client access message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMsg {
    pub model: ModelRef,
    pub ctx: MsgCtx,
    pub opcode: u32,
    pub body: Vec<u8>,
}

impl TxMsg {
    pub fn element_id(&self) -> u16 {
        self.model.element_idx
    }

    /// Whether the destination is expected to answer with a status.
    pub fn expects_status(&self) -> bool {
        !is_unack_opcode(self.opcode) && addr::is_unicast(self.ctx.dst_addr)
    }
}

pub fn is_unack_opcode(op: u32) -> bool {
    matches!(
        op,
        opcode::GEN_ONOFF_SET_UNACK
            | opcode::LIGHT_CTL_SET_UNACK
            | opcode::LIGHT_CTL_TEMPERATURE_SET_UNACK
            | opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET_UNACK
            | opcode::LIGHT_CTL_DEFAULT_SET_UNACK
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxKind {
    Acked,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    New,
    WaitingAck,
}

#[derive(Debug, Clone)]
struct TxEntry {
    msg: TxMsg,
    kind: TxKind,
    state: TxState,
    /// Sends made so far, the first one included.
    attempts: u8,
}

/// What a client timeout turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    /// The outstanding request went out again; nothing to report yet.
    Resent { attempt: u8 },
    /// The retry budget is spent; the request was dropped.
    GaveUp(TxMsg),
    /// No request of this element is waiting for a status.
    Untracked,
}

pub struct TxControl {
    queue: MessageQueue<TxEntry>,
    max_retries: u8,
}

impl TxControl {
    pub fn new(queue_depth: usize, max_retries: u8) -> Result<Self> {
        Ok(Self {
            queue: MessageQueue::create(queue_depth)?,
            max_retries,
        })
    }

    /// Requests queued, the one awaiting its status included.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Destination of the request currently waiting for a status.
    pub fn outstanding(&self, element_id: u16) -> Option<u16> {
        match self.queue.peek() {
            Ok(e) if e.state == TxState::WaitingAck && e.msg.element_id() == element_id => {
                Some(e.msg.ctx.dst_addr)
            }
            _ => None,
        }
    }

    /// Queue `msg` and send it if nothing is waiting ahead of it.
    pub fn submit(&self, port: &dyn MeshPort, msg: TxMsg) -> Result<()> {
        let kind = if msg.expects_status() {
            TxKind::Acked
        } else {
            TxKind::Direct
        };
        self.queue
            .try_send(TxEntry {
                msg,
                kind,
                state: TxState::New,
                attempts: 0,
            })
            .map_err(|e| match e {
                MeshxError::Full => MeshxError::NoMem("tx queue full".to_string()),
                other => other,
            })?;
        // the head is either empty or waiting, so only `msg` can go out now
        self.pump(port)
    }

    /// A status arrived for `element_id` from `src_addr`. Returns whether it
    /// settled the outstanding request.
    pub fn on_status(&self, port: &dyn MeshPort, element_id: u16, src_addr: u16) -> bool {
        if self.outstanding(element_id) != Some(src_addr) {
            return false;
        }
        if let Ok(done) = self.queue.try_recv() {
            debug!(
                target: "meshx::txcm",
                "el={} op=0x{:04x} acknowledged by 0x{:04x}",
                element_id, done.msg.opcode, src_addr
            );
        }
        if let Err(e) = self.pump(port) {
            warn!(target: "meshx::txcm", "next request failed to send: {}", e);
        }
        true
    }

    /// The stack gave up waiting for a status on `element_id`.
    pub fn on_timeout(&self, port: &dyn MeshPort, element_id: u16) -> TimeoutAction {
        if self.outstanding(element_id).is_none() {
            return TimeoutAction::Untracked;
        }
        let mut head = match self.queue.try_recv() {
            Ok(head) => head,
            Err(_) => return TimeoutAction::Untracked,
        };
        if head.attempts <= self.max_retries {
            head.attempts += 1;
            let attempt = head.attempts;
            debug!(
                target: "meshx::txcm",
                "el={} op=0x{:04x} resend {}/{}",
                element_id,
                head.msg.opcode,
                attempt - 1,
                self.max_retries
            );
            if let Err(e) = send(port, &head.msg) {
                warn!(target: "meshx::txcm", "el={} resend failed: {}", element_id, e);
            }
            if self.queue.try_send_front(head).is_err() {
                warn!(target: "meshx::txcm", "el={} lost its slot on resend", element_id);
            }
            return TimeoutAction::Resent { attempt };
        }
        warn!(
            target: "meshx::txcm",
            "el={} op=0x{:04x} unanswered after {} attempts",
            element_id, head.msg.opcode, head.attempts
        );
        if let Err(e) = self.pump(port) {
            warn!(target: "meshx::txcm", "next request failed to send: {}", e);
        }
        TimeoutAction::GaveUp(head.msg)
    }

    /// Send new entries from the head until one has to wait for a status.
    fn pump(&self, port: &dyn MeshPort) -> Result<()> {
        let mut first_err = None;
        while let Ok(front) = self.queue.peek() {
            if front.state != TxState::New {
                break;
            }
            let mut entry = self.queue.try_recv()?;
            let sent = send(port, &entry.msg);
            entry.attempts = 1;
            match (sent, entry.kind) {
                (Ok(()), TxKind::Acked) => {
                    entry.state = TxState::WaitingAck;
                    self.queue.try_send_front(entry)?;
                    break;
                }
                (Ok(()), TxKind::Direct) => {}
                (Err(e), _) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn send(port: &dyn MeshPort, msg: &TxMsg) -> Result<()> {
    port.send_msg(&msg.model, &msg.ctx, msg.opcode, &msg.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::composition::{sig, Composition, ModelId};
    use crate::port::{Capability, Ingress, ProvisioningDescriptor};

    #[derive(Default)]
    struct Wire {
        sent: Mutex<Vec<(u16, u32, Vec<u8>)>>,
    }

    impl Wire {
        fn sent(&self) -> Vec<(u16, u32, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MeshPort for Wire {
        fn platform_init(&self) -> Result<()> {
            Ok(())
        }
        fn platform_erase(&self) -> Result<()> {
            Ok(())
        }
        fn bt_init(&self) -> Result<()> {
            Ok(())
        }
        fn stack_init(&self, _: &ProvisioningDescriptor, _: &Composition) -> Result<()> {
            Ok(())
        }
        fn set_device_name(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn enable_provisioning(&self, _: u8) -> Result<()> {
            Ok(())
        }
        fn send_msg(&self, model: &ModelRef, ctx: &MsgCtx, opcode: u32, payload: &[u8]) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((model.element_idx, opcode, payload.to_vec()));
            assert_eq!(ctx.opcode, opcode);
            Ok(())
        }
        fn publish(&self, _: &ModelRef, _: u32, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn is_group_subscribed(&self, _: &ModelRef, _: u16) -> bool {
            false
        }
        fn register_callback(&self, _: Capability, _: Ingress) -> Result<()> {
            Ok(())
        }
    }

    fn msg(element: u16, dst: u16, op: u32, tid: u8) -> TxMsg {
        TxMsg {
            model: ModelRef {
                element_idx: element,
                model_id: ModelId::Sig(sig::GEN_ONOFF_CLI),
                pub_addr: dst,
            },
            ctx: MsgCtx {
                dst_addr: dst,
                opcode: op,
                ..MsgCtx::default()
            },
            opcode: op,
            body: vec![1, tid],
        }
    }

    #[test]
    fn acked_requests_go_out_one_at_a_time() {
        let wire = Wire::default();
        let tx = TxControl::new(4, 2).unwrap();
        tx.submit(&wire, msg(1, 0x0100, opcode::GEN_ONOFF_SET, 0)).unwrap();
        tx.submit(&wire, msg(1, 0x0100, opcode::GEN_ONOFF_SET, 1)).unwrap();
        assert_eq!(wire.sent().len(), 1);
        assert_eq!(tx.outstanding(1), Some(0x0100));
        assert_eq!(tx.pending(), 2);

        // a status from somebody else settles nothing
        assert!(!tx.on_status(&wire, 1, 0x0200));
        assert!(tx.on_status(&wire, 1, 0x0100));
        let sent = wire.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].2, vec![1, 1]);
        assert!(tx.on_status(&wire, 1, 0x0100));
        assert_eq!(tx.pending(), 0);
    }

    #[test]
    fn group_and_unack_requests_are_not_retained() {
        let wire = Wire::default();
        let tx = TxControl::new(4, 2).unwrap();
        tx.submit(&wire, msg(1, 0xC001, opcode::GEN_ONOFF_SET, 0)).unwrap();
        tx.submit(&wire, msg(1, 0x0100, opcode::GEN_ONOFF_SET_UNACK, 1)).unwrap();
        assert_eq!(wire.sent().len(), 2);
        assert_eq!(tx.pending(), 0);
        assert_eq!(tx.on_timeout(&wire, 1), TimeoutAction::Untracked);
    }

    #[test]
    fn timeouts_resend_until_the_budget_is_spent() {
        let wire = Wire::default();
        let tx = TxControl::new(4, 2).unwrap();
        let first = msg(3, 0x0100, opcode::GEN_ONOFF_GET, 0);
        tx.submit(&wire, first.clone()).unwrap();
        tx.submit(&wire, msg(3, 0xC002, opcode::GEN_ONOFF_SET, 1)).unwrap();

        assert_eq!(tx.on_timeout(&wire, 3), TimeoutAction::Resent { attempt: 2 });
        assert_eq!(tx.on_timeout(&wire, 3), TimeoutAction::Resent { attempt: 3 });
        assert_eq!(wire.sent().len(), 3);
        assert_eq!(tx.on_timeout(&wire, 3), TimeoutAction::GaveUp(first));

        // the group request behind it goes out once the head is dropped
        let sent = wire.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].2, vec![1, 1]);
        assert_eq!(tx.pending(), 0);
    }

    #[test]
    fn timeout_for_another_element_is_untracked() {
        let wire = Wire::default();
        let tx = TxControl::new(4, 1).unwrap();
        tx.submit(&wire, msg(1, 0x0100, opcode::GEN_ONOFF_SET, 0)).unwrap();
        assert_eq!(tx.on_timeout(&wire, 3), TimeoutAction::Untracked);
        assert_eq!(tx.outstanding(1), Some(0x0100));
    }

    #[test]
    fn full_queue_reports_no_memory() {
        let wire = Wire::default();
        let tx = TxControl::new(1, 1).unwrap();
        tx.submit(&wire, msg(1, 0x0100, opcode::GEN_ONOFF_SET, 0)).unwrap();
        let err = tx.submit(&wire, msg(1, 0x0100, opcode::GEN_ONOFF_SET, 1)).unwrap_err();
        assert!(matches!(err, MeshxError::NoMem(_)));
    }
}
