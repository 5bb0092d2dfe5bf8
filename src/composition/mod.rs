//! Element composition.
//!
//! The node describes itself to the mesh as a table of elements, each holding
//! SIG and vendor models. [`CompositionBuilder`] pre-allocates the table at
//! its maximum size, seeds the root element with the mandatory models and
//! hands out contiguous element slots to each element-type factory through a
//! cursor that starts at 1. [`CompositionBuilder::finalize`] truncates the
//! table to the cursor.

use serde::{Deserialize, Serialize};

use crate::error::{MeshxError, Result};

pub const MAX_ELEMENT_COUNT: usize = 5;
pub const ROOT_ELEMENT: usize = 0;
pub const LOC_UNKNOWN: u16 = 0x0000;
/// Publication TTL meaning "use the stack default".
pub const TTL_DEFAULT: u8 = 0xFF;
pub const APP_IDX_NONE: u16 = 0xFFFF;

/// SIG model identifiers used by the node.
pub mod sig {
    pub const CONFIG_SRV: u16 = 0x0000;
    pub const CONFIG_CLI: u16 = 0x0001;
    pub const REMOTE_PROV_SRV: u16 = 0x0004;
    pub const GEN_ONOFF_SRV: u16 = 0x1000;
    pub const GEN_ONOFF_CLI: u16 = 0x1001;
    pub const LIGHT_CTL_SRV: u16 = 0x1303;
    pub const LIGHT_CTL_SETUP_SRV: u16 = 0x1304;
    pub const LIGHT_CTL_CLI: u16 = 0x1305;
    pub const LIGHT_CTL_TEMP_SRV: u16 = 0x1306;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    Sig(u16),
    Vendor { company: u16, id: u16 },
}

impl ModelId {
    pub fn is_sig(&self) -> bool {
        matches!(self, ModelId::Sig(_))
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelId::Sig(id) => write!(f, "sig:{:04x}", id),
            ModelId::Vendor { company, id } => write!(f, "vnd:{:04x}:{:04x}", company, id),
        }
    }
}

/// Closed set of element types a node can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ElementType {
    RelayServer = 0,
    RelayClient = 1,
    CwwwServer = 2,
    CwwwClient = 3,
}

impl ElementType {
    pub const ALL: [ElementType; 4] = [
        ElementType::RelayServer,
        ElementType::RelayClient,
        ElementType::CwwwServer,
        ElementType::CwwwClient,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::RelayServer => "relay_server",
            ElementType::RelayClient => "relay_client",
            ElementType::CwwwServer => "cwww_server",
            ElementType::CwwwClient => "cwww_client",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub addr: u16,
    pub app_idx: u16,
    pub ttl: u8,
    pub period: u8,
    /// Count in the low 3 bits, interval steps in the high 5.
    pub retransmit: u8,
}

impl Default for Publication {
    fn default() -> Self {
        Self {
            addr: crate::port::addr::UNASSIGNED,
            app_idx: APP_IDX_NONE,
            ttl: TTL_DEFAULT,
            period: 0,
            retransmit: 0,
        }
    }
}

/// Whether the stack answers GET/SET itself before the core sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoResponse {
    pub get: bool,
    pub set: bool,
}

impl Default for AutoResponse {
    fn default() -> Self {
        Self { get: true, set: true }
    }
}

/// Links a model back to the element-type instance that owns its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub element_type: ElementType,
    pub instance: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub element_idx: usize,
    pub publication: Publication,
    pub auto_rsp: AutoResponse,
    pub user_data: Option<UserData>,
}

impl Model {
    pub fn sig(id: u16) -> Self {
        Self {
            id: ModelId::Sig(id),
            element_idx: ROOT_ELEMENT,
            publication: Publication::default(),
            auto_rsp: AutoResponse::default(),
            user_data: None,
        }
    }

    pub fn with_user_data(mut self, element_type: ElementType, instance: usize) -> Self {
        self.user_data = Some(UserData {
            element_type,
            instance,
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub location: u16,
    pub sig_models: Vec<Model>,
    pub vnd_models: Vec<Model>,
    /// Unicast address, assigned after provisioning.
    pub address: u16,
}

impl Element {
    pub fn sig_model_count(&self) -> usize {
        self.sig_models.len()
    }

    pub fn vnd_model_count(&self) -> usize {
        self.vnd_models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sig_models.is_empty() && self.vnd_models.is_empty()
    }

    pub fn find_model(&self, id: ModelId) -> Option<&Model> {
        let list = if id.is_sig() {
            &self.sig_models
        } else {
            &self.vnd_models
        };
        list.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    pub cid: u16,
    pub pid: u16,
    pub vid: u16,
    pub elements: Vec<Element>,
}

impl Composition {
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn element(&self, idx: usize) -> Option<&Element> {
        self.elements.get(idx)
    }

    /// Assign consecutive unicast addresses starting at the primary address.
    pub fn assign_addresses(&mut self, node_addr: u16) {
        for (i, el) in self.elements.iter_mut().enumerate() {
            el.address = node_addr.wrapping_add(i as u16);
        }
    }

    pub fn clear_addresses(&mut self) {
        for el in &mut self.elements {
            el.address = crate::port::addr::UNASSIGNED;
        }
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.elements
            .iter()
            .flat_map(|e| e.sig_models.iter().chain(e.vnd_models.iter()))
    }
}

/// Where each instance of one element type landed in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub element_type: ElementType,
    /// Element index per instance, in instance order.
    pub elements: Vec<usize>,
    pub folded: bool,
}

impl Placement {
    pub fn count(&self) -> usize {
        self.elements.len()
    }
}

pub struct CompositionBuilder {
    cid: u16,
    pid: u16,
    vid: u16,
    max: usize,
    elements: Vec<Element>,
    cursor: usize,
    placements: Vec<Placement>,
}

impl CompositionBuilder {
    /// Pre-allocate `max` empty elements and seed the root with the
    /// configuration and remote provisioning servers.
    pub fn new(cid: u16, pid: u16, vid: u16, max: usize) -> Result<Self> {
        if max == 0 {
            return Err(MeshxError::invalid_arg("composition needs at least the root element"));
        }
        let mut elements: Vec<Element> = Vec::new();
        elements
            .try_reserve_exact(max)
            .map_err(|_| MeshxError::NoMem(format!("{} element table", max)))?;
        elements.resize_with(max, Element::default);

        let root = &mut elements[ROOT_ELEMENT];
        root.location = LOC_UNKNOWN;
        root.sig_models.push(Model::sig(sig::CONFIG_SRV));
        root.sig_models.push(Model::sig(sig::REMOTE_PROV_SRV));

        Ok(Self {
            cid,
            pid,
            vid,
            max,
            elements,
            cursor: 1,
            placements: Vec::new(),
        })
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn max_elements(&self) -> usize {
        self.max
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Reserve element slots for `count` instances of one type.
    ///
    /// With `fold` set and the cursor still at 1, instance 0 shares the
    /// root element and the remaining instances take the following slots.
    pub fn place(&mut self, element_type: ElementType, count: usize, fold: bool) -> Result<Placement> {
        if count == 0 {
            return Err(MeshxError::invalid_arg(format!("{} needs a non-zero count", element_type)));
        }
        let folded = fold && self.cursor == 1;
        let needed = if folded { count - 1 } else { count };
        if self.cursor + needed > self.max {
            return Err(MeshxError::NoMem(format!(
                "{} x{} needs {} element(s) at cursor {}, table holds {}",
                element_type, count, needed, self.cursor, self.max
            )));
        }

        let mut indices = Vec::with_capacity(count);
        if folded {
            indices.push(ROOT_ELEMENT);
        }
        indices.extend(self.cursor..self.cursor + needed);
        self.cursor += needed;

        let placement = Placement {
            element_type,
            elements: indices,
            folded,
        };
        self.placements.push(placement.clone());
        Ok(placement)
    }

    /// Attach `model` to a reserved element, fixing its back-reference.
    pub fn add_model(&mut self, element_idx: usize, mut model: Model) -> Result<()> {
        if element_idx >= self.cursor {
            return Err(MeshxError::invalid_state(format!(
                "element {} has not been reserved (cursor {})",
                element_idx, self.cursor
            )));
        }
        model.element_idx = element_idx;
        let el = &mut self.elements[element_idx];
        let list = if model.id.is_sig() {
            &mut el.sig_models
        } else {
            &mut el.vnd_models
        };
        if list.iter().any(|m| m.id == model.id) {
            return Err(MeshxError::invalid_state(format!(
                "model {} already present on element {}",
                model.id, element_idx
            )));
        }
        list.try_reserve(1)
            .map_err(|_| MeshxError::NoMem(format!("model vector of element {}", element_idx)))?;
        list.push(model);
        Ok(())
    }

    pub fn element(&self, idx: usize) -> Option<&Element> {
        self.elements.get(idx)
    }

    /// Truncate the table to the cursor and check every back-reference.
    pub fn finalize(mut self) -> Result<Composition> {
        self.elements.truncate(self.cursor);
        for (idx, el) in self.elements.iter().enumerate() {
            if el.is_empty() {
                return Err(MeshxError::invalid_state(format!("element {} has no models", idx)));
            }
            if let Some(m) = el
                .sig_models
                .iter()
                .chain(el.vnd_models.iter())
                .find(|m| m.element_idx != idx)
            {
                return Err(MeshxError::invalid_state(format!(
                    "model {} on element {} points at element {}",
                    m.id, idx, m.element_idx
                )));
            }
        }
        Ok(Composition {
            cid: self.cid,
            pid: self.pid,
            vid: self.vid,
            elements: self.elements,
        })
    }
}
