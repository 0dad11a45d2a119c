//! Devices: named bundles of cells

use crate::cell::Cell;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Virtual-device definition as supplied by `defineVirtualDevice`
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualDeviceSpec {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cells: BTreeMap<String, VirtualCellSpec>,
}

/// A single cell in a virtual-device definition
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualCellSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub max: Option<f64>,
}

/// A device on the bus
///
/// A device is either virtual (its authoritative state is held by this
/// engine) or external (owned elsewhere). The flag is immutable after
/// creation; device names are unique process-wide.
#[derive(Debug)]
pub struct Device {
    name: String,
    title: String,
    is_virtual: bool,
    cells: HashMap<String, Cell>,
    cell_order: Vec<String>,
}

impl Device {
    #[must_use]
    pub fn new(name: &str, is_virtual: bool) -> Self {
        Self {
            name: name.to_string(),
            title: name.to_string(),
            is_virtual,
            cells: HashMap::new(),
            cell_order: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
    }

    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    #[must_use]
    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.get(name)
    }

    pub fn cell_mut(&mut self, name: &str) -> Option<&mut Cell> {
        self.cells.get_mut(name)
    }

    /// Get or create a cell, preserving declaration order.
    pub fn ensure_cell(&mut self, name: &str) -> &mut Cell {
        if !self.cells.contains_key(name) {
            self.cell_order.push(name.to_string());
        }
        self.cells
            .entry(name.to_string())
            .or_insert_with(|| Cell::new(name))
    }

    /// Cell names in declaration order.
    pub fn cell_names(&self) -> impl Iterator<Item = &str> {
        self.cell_order.iter().map(String::as_str)
    }

    /// Drop all cells (virtual-device redefinition).
    pub fn clear_cells(&mut self) {
        self.cells.clear();
        self.cell_order.clear();
    }
}
