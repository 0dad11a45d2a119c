//! The cell model: MQTT ingress observers and write fan-out

use crate::cell::{Cell, CellType};
use crate::device::{Device, VirtualDeviceSpec};
use crate::value::Value;
use mqtt_io::transport::Publisher;
use mqtt_io::{topics, Topic};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Model errors
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("device '{0}' already exists and is not virtual")]
    DeviceIsExternal(String),

    #[error("cell '{0}' is read-only")]
    ReadonlyCell(CellSpec),
}

/// `(device, cell)` identifier, written `dev/cell` in scripts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellSpec {
    pub device: String,
    pub cell: String,
}

impl CellSpec {
    #[must_use]
    pub fn new(device: &str, cell: &str) -> Self {
        Self {
            device: device.to_string(),
            cell: cell.to_string(),
        }
    }

    /// Parse the `dev/cell` form used by `whenChanged` and the `dev` proxy.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (device, cell) = s.split_once('/')?;
        if device.is_empty() || cell.is_empty() {
            return None;
        }
        Some(Self::new(device, cell))
    }
}

impl fmt::Display for CellSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.cell)
    }
}

/// Change notification handed back to the engine
///
/// The engine turns these into rule scans; the model itself never calls
/// back into the rule layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellEvent {
    pub spec: CellSpec,
    pub complete: bool,
}

/// Read-only view of a cell for tracked access
#[derive(Debug, Clone)]
pub struct CellSnapshot {
    pub value: Value,
    pub complete: bool,
    pub pushbutton: bool,
    pub readonly: bool,
}

/// Typed shadow of the device/control tree
pub struct CellModel {
    devices: HashMap<String, Device>,
    publisher: Arc<dyn Publisher>,
}

impl CellModel {
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            devices: HashMap::new(),
            publisher,
        }
    }

    #[must_use]
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Get or create a device record; externally-observed devices are
    /// created non-virtual.
    pub fn ensure_device(&mut self, name: &str) -> &mut Device {
        self.devices
            .entry(name.to_string())
            .or_insert_with(|| Device::new(name, false))
    }

    #[must_use]
    pub fn cell(&self, spec: &CellSpec) -> Option<&Cell> {
        self.devices.get(&spec.device)?.cell(&spec.cell)
    }

    /// Tracked read view; `None` when the cell has never been seen.
    #[must_use]
    pub fn snapshot(&self, spec: &CellSpec) -> Option<CellSnapshot> {
        let cell = self.cell(spec)?;
        Some(CellSnapshot {
            value: cell.value(),
            complete: cell.is_complete(),
            pushbutton: cell.is_pushbutton(),
            readonly: cell.is_readonly(),
        })
    }

    /// Define (or redefine) a virtual device and publish its metadata.
    ///
    /// Redefinition is allowed only for devices already known as virtual;
    /// the `virtual` flag is immutable after creation.
    pub fn define_virtual_device(
        &mut self,
        name: &str,
        spec: &VirtualDeviceSpec,
    ) -> Result<(), ModelError> {
        match self.devices.get(name) {
            Some(existing) if !existing.is_virtual() => {
                return Err(ModelError::DeviceIsExternal(name.to_string()))
            }
            _ => {}
        }

        let title = spec.title.clone().unwrap_or_else(|| name.to_string());
        let mut outbox: Vec<(String, String)> = vec![(topics::device_name(name), title.clone())];

        let device = self
            .devices
            .entry(name.to_string())
            .or_insert_with(|| Device::new(name, true));
        device.set_title(&title);
        device.clear_cells();

        for (cell_name, cell_spec) in &spec.cells {
            let cell_type = CellType::parse(&cell_spec.kind);
            let value = Value::from_json(&cell_spec.value, cell_type.value_kind());
            let cell = device.ensure_cell(cell_name);
            cell.set_readonly(cell_spec.readonly);
            cell.set_max(cell_spec.max);
            cell.set_local(cell_type.clone(), value.clone());

            outbox.push((
                topics::cell_meta(name, cell_name, "type"),
                cell_type.name().to_string(),
            ));
            outbox.push((
                topics::cell_meta(name, cell_name, "readonly"),
                if cell_spec.readonly { "1" } else { "0" }.to_string(),
            ));
            if let Some(max) = cell_spec.max {
                outbox.push((topics::cell_meta(name, cell_name, "max"), max.to_string()));
            }
            if !cell_type.is_pushbutton() {
                outbox.push((topics::cell_value(name, cell_name), value.to_payload()));
            }
        }

        for (topic, payload) in outbox {
            self.publish_logged(&topic, &payload, 0, true);
        }
        Ok(())
    }

    /// Route a parsed bus topic into the model.
    pub fn observe(&mut self, topic: &Topic, payload: &str) -> Option<CellEvent> {
        match topic {
            Topic::Device { .. } | Topic::Other(_) => None,
            Topic::DeviceMeta { device, key } => {
                if key == "name" {
                    self.ensure_device(device).set_title(payload);
                }
                None
            }
            Topic::CellValue { device, cell } => self.observe_value(device, cell, payload),
            Topic::CellMeta { device, cell, key } => {
                self.observe_meta(device, cell, key, payload)
            }
            Topic::CellOn { device, cell } => self.observe_on(device, cell, payload),
        }
    }

    fn observe_value(&mut self, device: &str, cell: &str, payload: &str) -> Option<CellEvent> {
        // Our own retained publishes echo back; the mirror of a virtual
        // cell is authoritative, so those are ignored
        if self
            .devices
            .get(device)
            .is_some_and(Device::is_virtual)
        {
            tracing::debug!("ignoring value echo for virtual cell {}/{}", device, cell);
            return None;
        }
        let entry = self.ensure_device(device).ensure_cell(cell);
        let fired = entry.observe_value(payload);
        let complete = entry.is_complete();
        fired.then(|| CellEvent {
            spec: CellSpec::new(device, cell),
            complete,
        })
    }

    fn observe_meta(
        &mut self,
        device: &str,
        cell: &str,
        key: &str,
        payload: &str,
    ) -> Option<CellEvent> {
        let entry = self.ensure_device(device).ensure_cell(cell);
        match key {
            "type" => {
                let fired = entry.observe_type(payload);
                let complete = entry.is_complete();
                fired.then(|| CellEvent {
                    spec: CellSpec::new(device, cell),
                    complete,
                })
            }
            "readonly" => {
                entry.set_readonly(payload == "1");
                None
            }
            "max" => {
                entry.set_max(payload.parse::<f64>().ok());
                None
            }
            _ => None,
        }
    }

    /// An `/on` write addressed to one of our virtual cells: validate
    /// against the cell type, update the mirror, republish retained.
    fn observe_on(&mut self, device: &str, cell: &str, payload: &str) -> Option<CellEvent> {
        if !self
            .devices
            .get(device)
            .is_some_and(Device::is_virtual)
        {
            // the write belongs to the real device; we'll see the echo
            return None;
        }
        let Some(entry) = self
            .devices
            .get_mut(device)
            .and_then(|d| d.cell_mut(cell))
        else {
            tracing::warn!("'/on' write to unknown virtual cell {}/{}", device, cell);
            return None;
        };
        let Some(kind) = entry.cell_type().map(CellType::value_kind) else {
            return None;
        };
        let value = Value::parse(payload, kind);
        let fired = entry.raw_value() != value.to_payload() || entry.is_pushbutton();
        entry.set_value_local(value.clone());
        let complete = entry.is_complete();

        self.publish_logged(
            &topics::cell_value(device, cell),
            &value.to_payload(),
            0,
            true,
        );
        fired.then(|| CellEvent {
            spec: CellSpec::new(device, cell),
            complete,
        })
    }

    /// Script-side write.
    ///
    /// Virtual cells publish the retained value and mirror synchronously;
    /// external cells publish to the `/on` subtopic (non-retained, QoS 1)
    /// and the mirror updates only when the echo arrives.
    pub fn set_value(
        &mut self,
        spec: &CellSpec,
        value: Value,
    ) -> Result<Option<CellEvent>, ModelError> {
        let device_is_virtual = self
            .devices
            .get(&spec.device)
            .is_some_and(Device::is_virtual);

        let entry = self
            .ensure_device(&spec.device)
            .ensure_cell(&spec.cell);
        if entry.is_readonly() {
            return Err(ModelError::ReadonlyCell(spec.clone()));
        }

        if device_is_virtual {
            let fired = entry.raw_value() != value.to_payload() || entry.is_pushbutton();
            entry.set_value_local(value.clone());
            let complete = entry.is_complete();
            self.publish_logged(
                &topics::cell_value(&spec.device, &spec.cell),
                &value.to_payload(),
                0,
                true,
            );
            Ok(fired.then(|| CellEvent {
                spec: spec.clone(),
                complete,
            }))
        } else {
            self.publish_logged(
                &topics::cell_on(&spec.device, &spec.cell),
                &value.to_payload(),
                1,
                false,
            );
            Ok(None)
        }
    }

    /// Publish, logging failures; per the write policy a failed publish
    /// never aborts the rule that triggered it.
    fn publish_logged(&self, topic: &str, payload: &str, qos: u8, retained: bool) {
        if let Err(e) = self.publisher.publish(topic, payload, qos, retained) {
            tracing::error!("publish to {} failed: {}", topic, e);
        }
    }

    /// Raw publish access for the host `publish()` global.
    #[must_use]
    pub fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::clone(&self.publisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<(String, String, u8, bool)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(
            &self,
            topic: &str,
            payload: &str,
            qos: u8,
            retained: bool,
        ) -> Result<(), mqtt_io::TransportError> {
            self.messages.lock().unwrap().push((
                topic.to_string(),
                payload.to_string(),
                qos,
                retained,
            ));
            Ok(())
        }
    }

    fn model() -> (CellModel, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        (CellModel::new(publisher.clone()), publisher)
    }

    fn vdev_spec(json: serde_json::Value) -> VirtualDeviceSpec {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_external_ingress_and_completeness() {
        let (mut model, _) = model();
        let topic = Topic::parse("/devices/wb-w1/controls/t");
        let event = model.observe(&topic, "21.5").unwrap();
        assert!(!event.complete);

        let meta = Topic::parse("/devices/wb-w1/controls/t/meta/type");
        let event = model.observe(&meta, "temperature").unwrap();
        assert!(event.complete);
        assert_eq!(
            model.cell(&CellSpec::new("wb-w1", "t")).unwrap().value(),
            Value::Float(21.5)
        );
    }

    #[test]
    fn test_virtual_write_updates_mirror_synchronously() {
        let (mut model, publisher) = model();
        model
            .define_virtual_device(
                "ctl",
                &vdev_spec(serde_json::json!({
                    "title": "Controls",
                    "cells": {"relay": {"type": "switch", "value": false}}
                })),
            )
            .unwrap();

        let spec = CellSpec::new("ctl", "relay");
        let event = model.set_value(&spec, Value::Bool(true)).unwrap().unwrap();
        assert!(event.complete);
        assert_eq!(model.cell(&spec).unwrap().value(), Value::Bool(true));

        let messages = publisher.messages.lock().unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.0, "/devices/ctl/controls/relay");
        assert_eq!(last.1, "1");
        assert!(last.3, "virtual writes are retained");
    }

    #[test]
    fn test_external_write_goes_to_on_and_leaves_mirror() {
        let (mut model, publisher) = model();
        let topic = Topic::parse("/devices/relay/controls/K1");
        model.observe(&topic, "0");
        let meta = Topic::parse("/devices/relay/controls/K1/meta/type");
        model.observe(&meta, "switch");

        let spec = CellSpec::new("relay", "K1");
        let event = model.set_value(&spec, Value::Bool(true)).unwrap();
        assert!(event.is_none());
        assert_eq!(model.cell(&spec).unwrap().value(), Value::Bool(false));

        let messages = publisher.messages.lock().unwrap();
        let last = messages.last().unwrap();
        assert_eq!(
            (last.0.as_str(), last.1.as_str(), last.2, last.3),
            ("/devices/relay/controls/K1/on", "1", 1, false)
        );
    }

    #[test]
    fn test_virtual_value_echo_is_ignored() {
        let (mut model, _) = model();
        model
            .define_virtual_device(
                "ctl",
                &vdev_spec(serde_json::json!({
                    "cells": {"relay": {"type": "switch", "value": true}}
                })),
            )
            .unwrap();
        let topic = Topic::parse("/devices/ctl/controls/relay");
        assert!(model.observe(&topic, "0").is_none());
        assert_eq!(
            model.cell(&CellSpec::new("ctl", "relay")).unwrap().value(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_on_write_to_virtual_cell() {
        let (mut model, publisher) = model();
        model
            .define_virtual_device(
                "ctl",
                &vdev_spec(serde_json::json!({
                    "cells": {"relay": {"type": "switch", "value": false}}
                })),
            )
            .unwrap();
        let topic = Topic::parse("/devices/ctl/controls/relay/on");
        let event = model.observe(&topic, "1").unwrap();
        assert_eq!(event.spec, CellSpec::new("ctl", "relay"));

        let messages = publisher.messages.lock().unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.0, "/devices/ctl/controls/relay");
        assert_eq!(last.1, "1");
    }

    #[test]
    fn test_external_device_cannot_become_virtual() {
        let (mut model, _) = model();
        let topic = Topic::parse("/devices/relay/controls/K1");
        model.observe(&topic, "0");
        let err = model
            .define_virtual_device("relay", &vdev_spec(serde_json::json!({"cells": {}})))
            .unwrap_err();
        assert!(matches!(err, ModelError::DeviceIsExternal(_)));
    }

    #[test]
    fn test_readonly_cell_rejects_write() {
        let (mut model, _) = model();
        model
            .define_virtual_device(
                "sensors",
                &vdev_spec(serde_json::json!({
                    "cells": {"t": {"type": "temperature", "value": 0, "readonly": true}}
                })),
            )
            .unwrap();
        let err = model
            .set_value(&CellSpec::new("sensors", "t"), Value::Int(42))
            .unwrap_err();
        assert!(matches!(err, ModelError::ReadonlyCell(_)));
    }
}
