//! Configuration server events as seen by the element layer.

use log::debug;

use crate::control::{frm_ble, EventMask};
use crate::port::{addr, ConfigServerEvent};

/// Element id of the element an event targets, relative to the primary
/// address.
pub fn element_id(node_addr: u16, ev: &ConfigServerEvent) -> Option<u16> {
    ev.element_addr.checked_sub(node_addr)
}

/// Apply an app-key bind or publication change to an element's
/// publication settings. Returns true when something must be persisted.
pub fn apply(evt: EventMask, ev: &ConfigServerEvent, pub_addr: &mut u16, app_id: &mut u16) -> bool {
    if evt & frm_ble::CFG_APP_KEY_BIND != 0 {
        *app_id = ev.app_idx;
        debug!("cfg srv: bind app 0x{:x} to 0x{:04x}", ev.app_idx, ev.element_addr);
        true
    } else if evt & frm_ble::CFG_PUB_ADD != 0 {
        *pub_addr = ev.pub_addr;
        *app_id = ev.app_idx;
        debug!("cfg srv: 0x{:04x} publishes to 0x{:04x}", ev.element_addr, ev.pub_addr);
        true
    } else if evt & frm_ble::CFG_PUB_DEL != 0 {
        *pub_addr = addr::UNASSIGNED;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::{sig, ModelId};

    fn ev(element_addr: u16) -> ConfigServerEvent {
        ConfigServerEvent {
            element_addr,
            pub_addr: 0xC001,
            app_idx: 2,
            model_id: ModelId::Sig(sig::GEN_ONOFF_SRV),
        }
    }

    #[test]
    fn pub_add_then_del() {
        let (mut pub_addr, mut app) = (0u16, 0u16);
        assert!(apply(frm_ble::CFG_PUB_ADD, &ev(0x12), &mut pub_addr, &mut app));
        assert_eq!((pub_addr, app), (0xC001, 2));
        assert!(apply(frm_ble::CFG_PUB_DEL, &ev(0x12), &mut pub_addr, &mut app));
        assert_eq!(pub_addr, addr::UNASSIGNED);
    }

    #[test]
    fn subscription_changes_need_no_save() {
        let (mut pub_addr, mut app) = (0u16, 0u16);
        assert!(!apply(frm_ble::CFG_SUB_ADD, &ev(0x12), &mut pub_addr, &mut app));
    }

    #[test]
    fn element_id_is_relative_to_primary() {
        assert_eq!(element_id(0x10, &ev(0x12)), Some(2));
        assert_eq!(element_id(0x10, &ev(0x05)), None);
    }
}
