//! Cells (a.k.a. controls) and their declared types

use crate::value::{Value, ValueKind};

/// Declared cell type
///
/// `switch`, `wo-switch` and `alarm` carry booleans; `text` and `rgb`
/// carry strings; everything else (including arbitrary names such as
/// `temperature`) is numeric. `pushbutton` has no persistent value: each
/// publish is an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellType {
    Switch,
    WoSwitch,
    Alarm,
    Pushbutton,
    Range,
    Text,
    Rgb,
    /// Arbitrary numeric type (e.g. `temperature`, `voltage`)
    Numeric(String),
}

impl CellType {
    #[must_use]
    pub fn parse(s: &str) -> CellType {
        match s {
            "switch" => CellType::Switch,
            "wo-switch" => CellType::WoSwitch,
            "alarm" => CellType::Alarm,
            "pushbutton" => CellType::Pushbutton,
            "range" => CellType::Range,
            "text" => CellType::Text,
            "rgb" => CellType::Rgb,
            other => CellType::Numeric(other.to_string()),
        }
    }

    /// The name published to `meta/type`.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            CellType::Switch => "switch",
            CellType::WoSwitch => "wo-switch",
            CellType::Alarm => "alarm",
            CellType::Pushbutton => "pushbutton",
            CellType::Range => "range",
            CellType::Text => "text",
            CellType::Rgb => "rgb",
            CellType::Numeric(name) => name,
        }
    }

    #[must_use]
    pub fn value_kind(&self) -> ValueKind {
        match self {
            CellType::Switch | CellType::WoSwitch | CellType::Alarm | CellType::Pushbutton => {
                ValueKind::Boolean
            }
            CellType::Text | CellType::Rgb => ValueKind::Text,
            CellType::Range | CellType::Numeric(_) => ValueKind::Numeric,
        }
    }

    #[must_use]
    pub fn is_pushbutton(&self) -> bool {
        matches!(self, CellType::Pushbutton)
    }
}

/// A single control belonging to a device
///
/// Completeness is a two-bit status: the value has been observed AND the
/// type has been observed. Until the type arrives, raw payloads are kept
/// and revalidated once it does.
#[derive(Debug, Clone)]
pub struct Cell {
    name: String,
    cell_type: Option<CellType>,
    value: Option<Value>,
    raw: Option<String>,
    readonly: bool,
    max: Option<f64>,
}

impl Cell {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cell_type: None,
            value: None,
            raw: None,
            readonly: false,
            max: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cell_type(&self) -> Option<&CellType> {
        self.cell_type.as_ref()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.cell_type.is_some() && self.value.is_some()
    }

    #[must_use]
    pub fn is_pushbutton(&self) -> bool {
        self.cell_type
            .as_ref()
            .is_some_and(CellType::is_pushbutton)
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn set_max(&mut self, max: Option<f64>) {
        self.max = max;
    }

    /// Current value; `Null` while unobserved.
    #[must_use]
    pub fn value(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }

    /// Last raw payload as received from the bus.
    #[must_use]
    pub fn raw_value(&self) -> &str {
        self.raw.as_deref().unwrap_or("")
    }

    /// Record a value observation.
    ///
    /// Returns true when observers should fire: first observation, a
    /// differing payload, or any publish to a pushbutton.
    pub fn observe_value(&mut self, payload: &str) -> bool {
        let changed = self.raw.as_deref() != Some(payload);
        self.raw = Some(payload.to_string());
        self.value = Some(match &self.cell_type {
            Some(t) => Value::parse(payload, t.value_kind()),
            // type unseen yet; keep the payload as text and revalidate
            // when the type arrives
            None => Value::Text(payload.to_string()),
        });
        changed || self.is_pushbutton()
    }

    /// Record a type observation, revalidating any pending raw value.
    ///
    /// Returns true when the observation changed the cell's typed value
    /// or newly completed the cell.
    pub fn observe_type(&mut self, type_name: &str) -> bool {
        let new_type = CellType::parse(type_name);
        if self.cell_type.as_ref() == Some(&new_type) {
            return false;
        }
        self.cell_type = Some(new_type);
        if let Some(raw) = self.raw.clone() {
            self.observe_value(&raw);
            return true;
        }
        false
    }

    /// Install a typed value directly (virtual-cell definition and writes).
    pub fn set_local(&mut self, cell_type: CellType, value: Value) {
        self.raw = Some(value.to_payload());
        self.cell_type = Some(cell_type);
        self.value = Some(value);
    }

    /// Overwrite the mirrored value of an already-typed cell.
    pub fn set_value_local(&mut self, value: Value) {
        self.raw = Some(value.to_payload());
        self.value = Some(value);
    }
}
