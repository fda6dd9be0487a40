use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Deserialize;

const INSERT_MARKER: &str = "插入设备";
const REMOVE_MARKER: &str = "移除设备";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    Insert,
    Remove,
}

impl fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEventKind::Insert => f.write_str("insert"),
            DeviceEventKind::Remove => f.write_str("remove"),
        }
    }
}

/// Canonical device change, independent of the transport that reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub label: String,
}

impl DeviceEvent {
    fn new(kind: DeviceEventKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// A descriptor whose label is its identifier.
    pub fn bare(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
        }
    }

    fn has_own_label(&self) -> bool {
        !self.label.trim().is_empty() && self.label != self.id
    }
}

/// A push message decoded into its parts. `label` is only present when the
/// sender supplied one separate from the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub kind: DeviceEventKind,
    pub id: String,
    pub label: Option<String>,
}

/// Turns push messages and snapshot polls into canonical events.
///
/// Owns the id to label cache used to name removed devices, the device set
/// from the previous poll, and the set of devices currently believed present.
#[derive(Debug, Default)]
pub struct DeviceEventRouter {
    labels: HashMap<String, String>,
    previous: Option<BTreeSet<String>>,
    present: BTreeMap<String, String>,
}

impl DeviceEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one push message. `None` means the message was not recognised.
    pub fn route_push(&mut self, raw: &str) -> Option<DeviceEvent> {
        let message = parse_message(raw)?;
        Some(self.apply(message))
    }

    /// Diffs a poll against the previous one.
    ///
    /// The first poll only establishes the baseline. Removals are reported
    /// before insertions, each in identifier order. An insert for a device
    /// already present, or a removal for one already gone, is dropped.
    pub fn diff_snapshot(&mut self, devices: Vec<DeviceDescriptor>) -> Vec<DeviceEvent> {
        let current: BTreeMap<String, DeviceDescriptor> = devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect();
        let ids: BTreeSet<String> = current.keys().cloned().collect();

        let Some(previous) = self.previous.replace(ids.clone()) else {
            for device in current.values() {
                if device.has_own_label() {
                    self.labels.insert(device.id.clone(), device.label.clone());
                }
                let label = self.label_for(&device.id);
                self.present.insert(device.id.clone(), label);
            }
            return Vec::new();
        };

        // Changes already reported by the push channel are not reported again.
        let mut events = Vec::new();
        for id in previous.difference(&ids) {
            if !self.present.contains_key(id) {
                continue;
            }
            events.push(self.apply(ParsedMessage {
                kind: DeviceEventKind::Remove,
                id: id.clone(),
                label: None,
            }));
        }
        for id in ids.difference(&previous) {
            if self.present.contains_key(id) {
                continue;
            }
            let label = current
                .get(id)
                .filter(|device| device.has_own_label())
                .map(|device| device.label.clone());
            events.push(self.apply(ParsedMessage {
                kind: DeviceEventKind::Insert,
                id: id.clone(),
                label,
            }));
        }
        for device in current.values() {
            if device.has_own_label() {
                self.labels.insert(device.id.clone(), device.label.clone());
            }
        }
        events
    }

    /// Forgets the poll baseline and the present set, keeping cached labels.
    /// The next poll becomes a fresh silent baseline.
    pub fn reset_baseline(&mut self) {
        self.previous = None;
        self.present.clear();
    }

    /// Records devices reported as mounted when a channel opens, without events.
    pub fn seed_present(&mut self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            let label = self.label_for(&id);
            self.present.insert(id, label);
        }
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.present
            .iter()
            .map(|(id, label)| DeviceDescriptor::new(id.clone(), label.clone()))
            .collect()
    }

    pub fn cached_label(&self, id: &str) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    fn apply(&mut self, message: ParsedMessage) -> DeviceEvent {
        let ParsedMessage { kind, id, label } = message;
        match kind {
            DeviceEventKind::Insert => {
                let label = label.unwrap_or_else(|| self.label_for(&id));
                if label != id {
                    self.labels.insert(id.clone(), label.clone());
                }
                self.present.insert(id, label.clone());
                DeviceEvent::new(kind, label)
            }
            DeviceEventKind::Remove => {
                self.present.remove(&id);
                let label = self.labels.remove(&id).or(label).unwrap_or(id);
                DeviceEvent::new(kind, label)
            }
        }
    }

    fn label_for(&self, id: &str) -> String {
        self.labels
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

/// Parses a structured JSON message or a free-text line with an insert or
/// remove marker.
pub fn parse_message(raw: &str) -> Option<ParsedMessage> {
    parse_structured(raw).or_else(|| parse_tagged(raw))
}

#[derive(Deserialize)]
struct StructuredMessage {
    #[serde(rename = "type", alias = "event")]
    kind: String,
    device: StructuredDevice,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StructuredDevice {
    Plain(String),
    Described {
        #[serde(alias = "id")]
        device: String,
        #[serde(default)]
        label: Option<String>,
    },
}

fn parse_structured(raw: &str) -> Option<ParsedMessage> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let message: StructuredMessage = serde_json::from_str(trimmed).ok()?;
    let kind = match message.kind.trim().to_ascii_lowercase().as_str() {
        "insert" | "inserted" | "mount" | "add" | "attach" => DeviceEventKind::Insert,
        "remove" | "removed" | "unmount" | "detach" => DeviceEventKind::Remove,
        _ => return None,
    };
    let (id, label) = match message.device {
        StructuredDevice::Plain(device) => (device, None),
        StructuredDevice::Described { device, label } => (device, label),
    };
    let id = id.trim().to_string();
    if id.is_empty() {
        return None;
    }
    let label = label
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty());
    Some(ParsedMessage { kind, id, label })
}

fn parse_tagged(raw: &str) -> Option<ParsedMessage> {
    let (kind, rest) = if let Some(index) = raw.find(INSERT_MARKER) {
        (DeviceEventKind::Insert, &raw[index + INSERT_MARKER.len()..])
    } else if let Some(index) = raw.find(REMOVE_MARKER) {
        (DeviceEventKind::Remove, &raw[index + REMOVE_MARKER.len()..])
    } else {
        return None;
    };

    let content = rest
        .trim_start()
        .trim_start_matches([':', '：'])
        .trim();
    let id = strip_capacity_suffix(content);
    if id.is_empty() {
        return None;
    }
    Some(ParsedMessage {
        kind,
        id: id.to_string(),
        label: None,
    })
}

/// `"USB-Drive (16GB)"` becomes `"USB-Drive"`.
fn strip_capacity_suffix(label: &str) -> &str {
    let trimmed = label.trim_end();
    let open = if trimmed.ends_with(')') {
        trimmed.rfind('(')
    } else if trimmed.ends_with('）') {
        trimmed.rfind('（')
    } else {
        None
    };
    match open.map(|index| trimmed[..index].trim_end()) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => trimmed,
    }
}
