//! Shared data model: places, parts and import specifications
//!
//! These types appear on the control-plane wire (JSON) and in the TOML
//! description files of exporters and agents. Validation is eager: a
//! description that deserializes is structurally sound, and `validate()`
//! catches the remaining range rules before anything is registered.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Number of selectable USB port slots per speed class on the virtual
/// host controller (ports 0-7 high-speed, 8-15 super-speed).
pub const VHCI_PORTS_PER_SPEED: u8 = 8;

/// A validated USB bus id of the form `<bus>-<port>(.<port>)*`, e.g. "1-5.1.4".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbId(String);

impl UsbId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UsbId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        fn is_number(s: &str) -> bool {
            !s.is_empty() && !s.starts_with('0') && s.bytes().all(|b| b.is_ascii_digit())
        }

        let valid = match value.split_once('-') {
            Some((bus, path)) => is_number(bus) && path.split('.').all(is_number),
            None => false,
        };

        if valid {
            Ok(UsbId(value))
        } else {
            Err(ModelError::InvalidUsbId(value))
        }
    }
}

impl std::str::FromStr for UsbId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UsbId::try_from(s.to_owned())
    }
}

impl From<UsbId> for String {
    fn from(id: UsbId) -> Self {
        id.0
    }
}

/// A TCP endpoint exported by a part, reachable from the exporter host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpIface {
    pub host: String,
    pub port: u16,
}

/// A USB device exported by a part, identified by its bus id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsbIface {
    pub usbid: UsbId,
}

/// A member of a place: a tagged bundle of TCP and USB interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Part {
    pub compatible: Vec<String>,
    #[serde(default)]
    pub tcp: BTreeMap<String, TcpIface>,
    #[serde(default)]
    pub usb: BTreeMap<String, UsbIface>,
}

impl Part {
    /// Tag set used for matching: compatible strings plus the names of the
    /// interfaces the part offers.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self
            .compatible
            .iter()
            .map(|c| format!("compatible:{c}"))
            .collect();
        tags.extend(self.tcp.keys().map(|k| format!("tcp:{k}")));
        tags.extend(self.usb.keys().map(|k| format!("usb:{k}")));
        tags
    }
}

/// An exporter's place description, as loaded from its TOML file and sent
/// with `register_exporter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportDesc {
    /// Port the exporter gateway listens on.
    pub port: u16,
    pub parts: Vec<Part>,
}

impl ExportDesc {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.port == 0 {
            return Err(ModelError::InvalidPort("gateway port must not be 0"));
        }
        if self.parts.is_empty() {
            return Err(ModelError::EmptyParts);
        }
        for part in &self.parts {
            for iface in part.tcp.values() {
                if iface.port == 0 {
                    return Err(ModelError::InvalidPort("tcp interface port must not be 0"));
                }
            }
        }
        Ok(())
    }
}

/// A registered place: an export description plus the identity the hub
/// assigned on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub id: u64,
    /// Exporter host, discovered from the control channel's peer address.
    pub host: String,
    pub port: u16,
    pub parts: Vec<Part>,
}

impl Place {
    pub fn new(id: u64, host: String, desc: ExportDesc) -> Self {
        Self {
            id,
            host,
            port: desc.port,
            parts: desc.parts,
        }
    }
}

/// Requested TCP interface: forwarded to a local listening port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpImport {
    pub local_port: u16,
}

/// Requested USB interface: attached to a local VHCI port slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsbImport {
    pub port_num: u8,
}

/// The requirements one import part places on a place part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartSpec {
    pub compatible: Vec<String>,
    #[serde(default)]
    pub tcp: BTreeMap<String, TcpImport>,
    #[serde(default)]
    pub usb: BTreeMap<String, UsbImport>,
}

impl PartSpec {
    /// Tags this spec requires a part to carry.
    pub fn required_tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self
            .compatible
            .iter()
            .map(|c| format!("compatible:{c}"))
            .collect();
        tags.extend(self.tcp.keys().map(|k| format!("tcp:{k}")));
        tags.extend(self.usb.keys().map(|k| format!("usb:{k}")));
        tags
    }

    /// A spec matches a part iff its required tags are a subset of the
    /// part's tags.
    pub fn matches(&self, part: &Part) -> bool {
        self.required_tags().is_subset(&part.tags())
    }
}

fn default_auto_return_time() -> Duration {
    Duration::from_secs(10 * 3600)
}

/// The agent-side description of a desired place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportSpec {
    /// Reservation is force-returned this long after the last attach or
    /// edit. Zero disables the timer.
    #[serde(default = "default_auto_return_time", with = "duration_str")]
    pub auto_return_time: Duration,
    pub parts: BTreeMap<String, PartSpec>,
}

impl ImportSpec {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.parts.is_empty() {
            return Err(ModelError::EmptyParts);
        }
        for spec in self.parts.values() {
            for iface in spec.tcp.values() {
                if iface.local_port == 0 {
                    return Err(ModelError::InvalidPort("local_port must not be 0"));
                }
            }
            for iface in spec.usb.values() {
                if iface.port_num >= VHCI_PORTS_PER_SPEED {
                    return Err(ModelError::InvalidPortNum(iface.port_num));
                }
            }
        }
        Ok(())
    }
}

/// Why a reservation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnReason {
    /// Returned by its owner.
    Returned,
    /// Every candidate place was deregistered while the reservation was
    /// still pending.
    CandidatesGone,
    /// The exporter owning the allocated place disappeared.
    ExporterGone,
    /// The agent's control channel closed.
    AgentGone,
    /// The auto-return timer fired.
    AutoReturn,
}

impl fmt::Display for ReturnReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReturnReason::Returned => "returned",
            ReturnReason::CandidatesGone => "candidates_gone",
            ReturnReason::ExporterGone => "exporter_gone",
            ReturnReason::AgentGone => "agent_gone",
            ReturnReason::AutoReturn => "auto_return",
        };
        f.write_str(s)
    }
}

/// Serde helper for durations written as `"1h30m"`, `"20s"` or a bare
/// number of seconds. `"0"` is allowed and means disabled.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a duration string like "1h", "30m", "1h30m" or "90" (seconds).
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total_secs: u64 = 0;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
            } else {
                if current_num.is_empty() {
                    return Err(format!("invalid duration format: {s}"));
                }
                let num: u64 = current_num
                    .parse()
                    .map_err(|_| format!("invalid number in duration: {current_num}"))?;
                current_num.clear();

                match c {
                    'h' => total_secs += num * 3600,
                    'm' => total_secs += num * 60,
                    's' => total_secs += num,
                    _ => return Err(format!("invalid duration unit: {c}")),
                }
            }
        }

        // A trailing bare number counts as seconds.
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("invalid number in duration: {current_num}"))?;
            total_secs += num;
        }

        Ok(Duration::from_secs(total_secs))
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{hours}h"));
        }
        if mins > 0 {
            result.push_str(&format!("{mins}m"));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{secs}s"));
        }
        result
    }
}
