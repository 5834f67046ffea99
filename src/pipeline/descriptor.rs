//! Declarative stage descriptions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of processing a stage performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Source,
    Convert,
    Scale,
    Encode,
    Mux,
    Sink,
    Filter,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Source => "source",
            StageKind::Convert => "convert",
            StageKind::Scale => "scale",
            StageKind::Encode => "encode",
            StageKind::Mux => "mux",
            StageKind::Sink => "sink",
            StageKind::Filter => "filter",
        };
        write!(f, "{}", name)
    }
}

/// Free-form property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Str(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<u16> for PropertyValue {
    fn from(v: u16) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

/// One stage of a graph, as submitted to the builder
///
/// Properties are not interpreted here; the runtime validates them when the
/// stage is instantiated. The few the controller does look at are `device`
/// (capture source, live), `is-live` and a sink's `role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl StageDescriptor {
    pub fn new(kind: StageKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Set a property, replacing any previous value
    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Capture device this stage reads, if it is a device source
    pub fn device(&self) -> Option<&str> {
        match self.kind {
            StageKind::Source => self.property("device").and_then(PropertyValue::as_str),
            _ => None,
        }
    }

    /// Whether this stage renders into a window
    pub fn is_display_sink(&self) -> bool {
        self.kind == StageKind::Sink
            && self.property("role").and_then(PropertyValue::as_str) == Some("display")
    }

    /// Whether this stage produces data without end (capture devices)
    pub fn is_live_source(&self) -> bool {
        if self.kind != StageKind::Source {
            return false;
        }
        match self.property("is-live").and_then(PropertyValue::as_bool) {
            Some(live) => live,
            None => self.device().is_some(),
        }
    }

    pub fn test_source(name: impl Into<String>) -> Self {
        Self::new(StageKind::Source, name)
    }

    pub fn device_source(name: impl Into<String>, device: &str) -> Self {
        Self::new(StageKind::Source, name).with("device", device)
    }

    pub fn file_source(name: impl Into<String>, location: &str) -> Self {
        Self::new(StageKind::Source, name).with("location", location)
    }

    pub fn convert(name: impl Into<String>) -> Self {
        Self::new(StageKind::Convert, name)
    }

    pub fn scale(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self::new(StageKind::Scale, name)
            .with("width", width)
            .with("height", height)
    }

    pub fn filter(name: impl Into<String>) -> Self {
        Self::new(StageKind::Filter, name)
    }

    pub fn encode(name: impl Into<String>) -> Self {
        Self::new(StageKind::Encode, name)
    }

    pub fn mux(name: impl Into<String>) -> Self {
        Self::new(StageKind::Mux, name)
    }

    pub fn sink(name: impl Into<String>) -> Self {
        Self::new(StageKind::Sink, name)
    }

    pub fn display_sink(name: impl Into<String>) -> Self {
        Self::sink(name).with("role", "display")
    }

    pub fn network_sink(name: impl Into<String>, host: &str, port: u16) -> Self {
        Self::sink(name)
            .with("role", "network")
            .with("host", host)
            .with("port", port)
    }

    pub fn null_sink(name: impl Into<String>) -> Self {
        Self::sink(name).with("role", "null")
    }
}

/// How the stages of a descriptor list are linked
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Topology {
    /// Each stage feeds the next one in list order
    #[default]
    Linear,

    /// Explicit `(from, to)` links, for branching graphs
    Edges(Vec<(String, String)>),
}

impl Topology {
    /// Resolve to `(from, to)` name pairs over `descriptors`
    pub fn links<'a>(&'a self, descriptors: &'a [StageDescriptor]) -> Vec<(&'a str, &'a str)> {
        match self {
            Topology::Linear => descriptors
                .windows(2)
                .map(|pair| (pair[0].name.as_str(), pair[1].name.as_str()))
                .collect(),
            Topology::Edges(edges) => edges
                .iter()
                .map(|(from, to)| (from.as_str(), to.as_str()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_classification() {
        assert!(StageDescriptor::device_source("cam", "/dev/video0").is_live_source());
        assert!(!StageDescriptor::test_source("src").is_live_source());
        assert!(StageDescriptor::test_source("src").with("is-live", true).is_live_source());
        assert!(
            !StageDescriptor::device_source("cam", "/dev/video0")
                .with("is-live", false)
                .is_live_source()
        );
        assert!(!StageDescriptor::display_sink("out").is_live_source());
    }

    #[test]
    fn test_display_sink_detection() {
        assert!(StageDescriptor::display_sink("out").is_display_sink());
        assert!(!StageDescriptor::null_sink("out").is_display_sink());
        assert!(!StageDescriptor::network_sink("net", "127.0.0.1", 5000).is_display_sink());
        assert!(!StageDescriptor::convert("display").with("role", "display").is_display_sink());
    }

    #[test]
    fn test_deserialize_properties() {
        let json = r#"{
            "kind": "source",
            "name": "cam",
            "properties": { "device": "/dev/video2", "framerate": 15, "is-live": true, "gain": 0.5 }
        }"#;
        let descriptor: StageDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.kind, StageKind::Source);
        assert_eq!(descriptor.device(), Some("/dev/video2"));
        assert_eq!(descriptor.property("framerate"), Some(&PropertyValue::Int(15)));
        assert_eq!(descriptor.property("gain"), Some(&PropertyValue::Float(0.5)));
        assert_eq!(
            descriptor.property("is-live").and_then(PropertyValue::as_bool),
            Some(true)
        );
    }

    #[test]
    fn test_linear_links() {
        let descriptors = vec![
            StageDescriptor::test_source("a"),
            StageDescriptor::convert("b"),
            StageDescriptor::null_sink("c"),
        ];
        assert_eq!(
            Topology::Linear.links(&descriptors),
            vec![("a", "b"), ("b", "c")]
        );
    }
}
