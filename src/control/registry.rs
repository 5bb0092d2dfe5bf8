//! Code-keyed subscription registry.
//!
//! One mutex-guarded list per code. Lists keep insertion order and never
//! dedupe, so the same handler may sit under several masks. Lookups clone
//! the matching handlers out of the lock before anything is invoked, which
//! lets a handler subscribe or unsubscribe while it runs.

use std::sync::{Arc, Mutex, MutexGuard};

use super::codes::{Code, EventMask, CODE_MAX};
use crate::error::{MeshxError, Result};

/// Subscriber invoked by the dispatcher for every matching message.
///
/// `event` is the full event value of the message, not its intersection with
/// the registration mask. `payload` is only valid for the duration of the call.
pub trait Handler<C>: Send + Sync {
    fn on_event(&self, ctx: &C, event: EventMask, payload: &[u8]) -> Result<()>;
}

impl<C, F> Handler<C> for F
where
    F: Fn(&C, EventMask, &[u8]) -> Result<()> + Send + Sync,
{
    fn on_event(&self, ctx: &C, event: EventMask, payload: &[u8]) -> Result<()> {
        self(ctx, event, payload)
    }
}

pub type HandlerRef<C> = Arc<dyn Handler<C>>;

fn same_handler<C>(a: &HandlerRef<C>, b: &HandlerRef<C>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

struct Registration<C> {
    mask: EventMask,
    handler: HandlerRef<C>,
}

pub struct Registry<C> {
    lists: [Mutex<Vec<Registration<C>>>; CODE_MAX],
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            lists: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }
}

impl<C> Registry<C> {
    fn list(&self, code: Code) -> MutexGuard<'_, Vec<Registration<C>>> {
        self.lists[code.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, code: Code, mask: EventMask, handler: HandlerRef<C>) -> Result<()> {
        if mask == 0 {
            return Err(MeshxError::invalid_arg(format!(
                "empty event mask for {}",
                code
            )));
        }
        let mut list = self.list(code);
        list.try_reserve(1)
            .map_err(|_| MeshxError::NoMem(format!("registration under {}", code)))?;
        list.push(Registration { mask, handler });
        Ok(())
    }

    /// Remove the first registration matching both `mask` and `handler`.
    pub fn unsubscribe(&self, code: Code, mask: EventMask, handler: &HandlerRef<C>) -> Result<()> {
        let mut list = self.list(code);
        match list
            .iter()
            .position(|r| r.mask == mask && same_handler(&r.handler, handler))
        {
            Some(pos) => {
                list.remove(pos);
                Ok(())
            }
            None => Err(MeshxError::NotFound(format!(
                "registration under {} mask 0x{:x}",
                code, mask
            ))),
        }
    }

    /// Handlers whose mask intersects `event`, in insertion order.
    pub fn matching(&self, code: Code, event: EventMask) -> Vec<HandlerRef<C>> {
        self.list(code)
            .iter()
            .filter(|r| r.mask & event != 0)
            .map(|r| r.handler.clone())
            .collect()
    }

    pub fn count(&self, code: Code) -> usize {
        self.list(code).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> HandlerRef<()> {
        Arc::new(|_: &(), _: EventMask, _: &[u8]| -> Result<()> { Ok(()) })
    }

    #[test]
    fn zero_mask_is_rejected() {
        let reg = Registry::<()>::default();
        assert!(matches!(
            reg.subscribe(Code::System, 0, noop()),
            Err(MeshxError::InvalidArg(_))
        ));
    }

    #[test]
    fn same_handler_under_two_masks_coexists() {
        let reg = Registry::<()>::default();
        let h = noop();
        reg.subscribe(Code::ToHal, 0b01, h.clone()).unwrap();
        reg.subscribe(Code::ToHal, 0b10, h.clone()).unwrap();
        assert_eq!(reg.matching(Code::ToHal, 0b11).len(), 2);
        assert_eq!(reg.matching(Code::ToHal, 0b10).len(), 1);

        reg.unsubscribe(Code::ToHal, 0b01, &h).unwrap();
        assert_eq!(reg.count(Code::ToHal), 1);
        assert!(matches!(
            reg.unsubscribe(Code::ToHal, 0b01, &h),
            Err(MeshxError::NotFound(_))
        ));
    }

    #[test]
    fn unsubscribe_matches_handler_identity() {
        let reg = Registry::<()>::default();
        let a = noop();
        let b = noop();
        reg.subscribe(Code::System, 1, a.clone()).unwrap();
        assert!(reg.unsubscribe(Code::System, 1, &b).is_err());
        assert!(reg.unsubscribe(Code::System, 1, &a).is_ok());
    }
}
