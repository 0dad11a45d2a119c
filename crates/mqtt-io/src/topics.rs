//! Topic grammar for the device bus
//!
//! Topic layout:
//! ```text
//! /devices/<dev>                            device presence
//! /devices/<dev>/meta/<key>                 device metadata (retained)
//! /devices/<dev>/controls/<cell>            current value (retained)
//! /devices/<dev>/controls/<cell>/meta/<key> cell metadata (retained)
//! /devices/<dev>/controls/<cell>/on         write side for external devices
//! /wbrules/log/<level>                      log fan-out
//! /wbrules/updates/<changed|removed>        source-file change notifications
//! ```

/// Device name of the engine's own settings device.
pub const ENGINE_DEVICE: &str = "wbrules";

/// Cell name of the debug-forwarding switch on [`ENGINE_DEVICE`].
pub const RULE_DEBUG_CELL: &str = "Rule debugging";

/// Topic filters the engine subscribes to.
pub const SUBSCRIPTIONS: &[&str] = &[
    "/devices/+/meta/+",
    "/devices/+/controls/+",
    "/devices/+/controls/+/meta/+",
    "/devices/+/controls/+/on",
];

/// A parsed bus topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// `/devices/<dev>`
    Device { device: String },
    /// `/devices/<dev>/meta/<key>`
    DeviceMeta { device: String, key: String },
    /// `/devices/<dev>/controls/<cell>`
    CellValue { device: String, cell: String },
    /// `/devices/<dev>/controls/<cell>/meta/<key>`
    CellMeta {
        device: String,
        cell: String,
        key: String,
    },
    /// `/devices/<dev>/controls/<cell>/on`
    CellOn { device: String, cell: String },
    /// Anything outside the device tree
    Other(String),
}

impl Topic {
    /// Parse a raw topic string into its bus meaning.
    #[must_use]
    pub fn parse(topic: &str) -> Self {
        let Some(rest) = topic.strip_prefix("/devices/") else {
            return Topic::Other(topic.to_string());
        };
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [device] if !device.is_empty() => Topic::Device {
                device: (*device).to_string(),
            },
            [device, "meta", key] => Topic::DeviceMeta {
                device: (*device).to_string(),
                key: (*key).to_string(),
            },
            [device, "controls", cell] => Topic::CellValue {
                device: (*device).to_string(),
                cell: (*cell).to_string(),
            },
            [device, "controls", cell, "on"] => Topic::CellOn {
                device: (*device).to_string(),
                cell: (*cell).to_string(),
            },
            [device, "controls", cell, "meta", key] => Topic::CellMeta {
                device: (*device).to_string(),
                cell: (*cell).to_string(),
                key: (*key).to_string(),
            },
            _ => Topic::Other(topic.to_string()),
        }
    }
}

/// `/devices/<dev>/meta/name`
#[must_use]
pub fn device_name(device: &str) -> String {
    format!("/devices/{device}/meta/name")
}

/// `/devices/<dev>/controls/<cell>`
#[must_use]
pub fn cell_value(device: &str, cell: &str) -> String {
    format!("/devices/{device}/controls/{cell}")
}

/// `/devices/<dev>/controls/<cell>/on`
#[must_use]
pub fn cell_on(device: &str, cell: &str) -> String {
    format!("/devices/{device}/controls/{cell}/on")
}

/// `/devices/<dev>/controls/<cell>/meta/<key>`
#[must_use]
pub fn cell_meta(device: &str, cell: &str, key: &str) -> String {
    format!("/devices/{device}/controls/{cell}/meta/{key}")
}

/// `/wbrules/log/<level>`
#[must_use]
pub fn log(level: &str) -> String {
    format!("/wbrules/log/{level}")
}

/// `/wbrules/updates/<changed|removed>`
#[must_use]
pub fn update(kind: &str) -> String {
    format!("/wbrules/updates/{kind}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell_value() {
        assert_eq!(
            Topic::parse("/devices/wb-w1/controls/t"),
            Topic::CellValue {
                device: "wb-w1".to_string(),
                cell: "t".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_cell_meta() {
        assert_eq!(
            Topic::parse("/devices/relay/controls/K1/meta/type"),
            Topic::CellMeta {
                device: "relay".to_string(),
                cell: "K1".to_string(),
                key: "type".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_cell_on() {
        assert_eq!(
            Topic::parse("/devices/relay/controls/K1/on"),
            Topic::CellOn {
                device: "relay".to_string(),
                cell: "K1".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_device_meta() {
        assert_eq!(
            Topic::parse("/devices/relay/meta/name"),
            Topic::DeviceMeta {
                device: "relay".to_string(),
                key: "name".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_foreign_topic() {
        assert_eq!(
            Topic::parse("/wbrules/log/info"),
            Topic::Other("/wbrules/log/info".to_string())
        );
    }

    #[test]
    fn test_format_round_trip() {
        let topic = cell_meta("dev", "cell", "max");
        assert_eq!(topic, "/devices/dev/controls/cell/meta/max");
        assert_eq!(
            Topic::parse(&topic),
            Topic::CellMeta {
                device: "dev".to_string(),
                cell: "cell".to_string(),
                key: "max".to_string(),
            }
        );
    }
}
