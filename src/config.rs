use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::assets::{
    DEFAULT_STREAM_HOST, DEFAULT_STREAM_PORT, STATE_POLL_INTERVAL_MS, TRANSITION_TIMEOUT_MS,
};
use crate::pipeline::descriptor::{StageDescriptor, Topology};
use crate::pipeline::error::ConfigError;
use crate::pipeline::events::EosAction;

/// How end-of-stream is treated, by source kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPolicy {
    /// End-of-stream from a live capture source
    pub live_eos: EosAction,
    /// End-of-stream from a file, test or network source
    pub finite_eos: EosAction,
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self {
            live_eos: EosAction::Fault,
            finite_eos: EosAction::Complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Upper bound on waiting for stages to settle after a transition request
    pub transition_timeout_ms: u64,
    /// How often stage states are polled while waiting
    pub poll_interval_ms: u64,
    /// Refuse to play a graph with a display sink until a surface is attached
    pub require_surface_for_display: bool,
    pub events: EventPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            transition_timeout_ms: TRANSITION_TIMEOUT_MS,
            poll_interval_ms: STATE_POLL_INTERVAL_MS,
            require_surface_for_display: true,
            events: EventPolicy::default(),
        }
    }
}

impl ControllerConfig {
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }
}

/// Named stage list a shell can build from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProfile {
    pub name: String,
    pub stages: Vec<StageDescriptor>,
    /// Explicit links; linear when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<(String, String)>,
}

impl PipelineProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    pub fn topology(&self) -> Topology {
        if self.edges.is_empty() {
            Topology::Linear
        } else {
            Topology::Edges(self.edges.clone())
        }
    }

    /// Capture device shown in a window
    pub fn webcam_display(device: &str) -> Self {
        Self {
            name: "webcam-display".to_string(),
            stages: vec![
                StageDescriptor::device_source("webcam_source", device),
                StageDescriptor::convert("convert"),
                StageDescriptor::display_sink("video_sink"),
            ],
            edges: Vec::new(),
        }
    }

    /// Capture device encoded and served over TCP
    pub fn webcam_stream(device: &str, host: &str, port: u16) -> Self {
        Self {
            name: "webcam-stream".to_string(),
            stages: vec![
                StageDescriptor::device_source("webcam_source", device),
                StageDescriptor::convert("convert"),
                StageDescriptor::encode("encoder"),
                StageDescriptor::mux("rtph264pay"),
                StageDescriptor::network_sink("tcpserversink", host, port),
            ],
            edges: Vec::new(),
        }
    }

    /// Capture device shown in a window and served over TCP at the same time
    pub fn webcam_display_and_stream(device: &str, host: &str, port: u16) -> Self {
        let link = |a: &str, b: &str| (a.to_string(), b.to_string());
        Self {
            name: "webcam-display-stream".to_string(),
            stages: vec![
                StageDescriptor::device_source("webcam_source", device),
                StageDescriptor::filter("tee"),
                StageDescriptor::convert("convert"),
                StageDescriptor::display_sink("video_overlay"),
                StageDescriptor::encode("encoder"),
                StageDescriptor::mux("rtph264pay"),
                StageDescriptor::network_sink("tcpserversink", host, port),
            ],
            edges: vec![
                link("webcam_source", "tee"),
                link("tee", "convert"),
                link("convert", "video_overlay"),
                link("tee", "encoder"),
                link("encoder", "rtph264pay"),
                link("rtph264pay", "tcpserversink"),
            ],
        }
    }

    /// Built-in profile by name
    pub fn builtin(name: &str, device: &str) -> Option<Self> {
        match name {
            "webcam-display" => Some(Self::webcam_display(device)),
            "webcam-stream" => Some(Self::webcam_stream(
                device,
                DEFAULT_STREAM_HOST,
                DEFAULT_STREAM_PORT,
            )),
            "webcam-display-stream" => Some(Self::webcam_display_and_stream(
                device,
                DEFAULT_STREAM_HOST,
                DEFAULT_STREAM_PORT,
            )),
            _ => None,
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "transition_timeout_ms": 250, "events": {{ "live_eos": "ignore" }} }}"#).unwrap();

        let config = ControllerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.transition_timeout(), Duration::from_millis(250));
        assert!(config.require_surface_for_display);
        assert_eq!(config.events.live_eos, EosAction::Ignore);
        assert_eq!(config.events.finite_eos, EosAction::Complete);
    }

    #[test]
    fn test_profile_from_file() {
        let profile = PipelineProfile::webcam_display_and_stream("/dev/video0", "127.0.0.1", 5000);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string_pretty(&profile).unwrap().as_bytes())
            .unwrap();

        let loaded = PipelineProfile::load(file.path()).unwrap();
        assert_eq!(loaded, profile);
        assert!(matches!(loaded.topology(), Topology::Edges(ref e) if e.len() == 6));
        assert_eq!(PipelineProfile::webcam_display("/dev/video0").topology(), Topology::Linear);
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            PipelineProfile::load("/nonexistent/profile.json"),
            Err(ConfigError::Io { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ \"name\": 3 }").unwrap();
        assert!(matches!(
            PipelineProfile::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_builtin_profiles() {
        assert!(PipelineProfile::builtin("webcam-stream", "/dev/video0").is_some());
        assert!(PipelineProfile::builtin("speed-gauge", "/dev/video0").is_none());
    }
}
