//! Components and compositions
//!
//! Components live in a per-device arena and reference their parent by index,
//! so the tree carries no ownership cycles.

use std::sync::Arc;

use crate::data_item::DataItem;

/// A node in the device's component tree
#[derive(Debug)]
pub struct Component {
    pub id: String,
    /// Element name: "Device", "Controller", "Linear", ...
    pub component_type: String,
    pub name: Option<String>,
    /// Arena index of the parent; `None` for the device root
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub data_items: Vec<Arc<DataItem>>,
    pub compositions: Vec<Composition>,
}

impl Component {
    pub fn new(
        id: impl Into<String>,
        component_type: impl Into<String>,
        name: Option<String>,
        parent: Option<usize>,
    ) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            name,
            parent,
            children: Vec::new(),
            data_items: Vec::new(),
            compositions: Vec::new(),
        }
    }

    /// Path segment for topics and streams: `Type[name]`, or `Type` when the
    /// component is unnamed.
    pub fn path_segment(&self) -> String {
        match &self.name {
            Some(name) => format!("{}[{}]", self.component_type, name),
            None => self.component_type.clone(),
        }
    }

    /// Structural identity used by the device diff
    pub(crate) fn same_structure(&self, other: &Component) -> bool {
        self.id == other.id
            && self.component_type == other.component_type
            && self.name == other.name
            && self.parent == other.parent
            && self.compositions == other.compositions
    }
}

/// A composition element of a component
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub id: String,
    pub composition_type: String,
    pub name: Option<String>,
}

/// Device description block, mutable through adapter commands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Description {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub station: Option<String>,
    pub value: Option<String>,
}
