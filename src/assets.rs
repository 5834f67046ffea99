pub const DEFAULT_FRAMERATE: u32 = 30;
pub const DEFAULT_FRAME_WIDTH: u32 = 640;
pub const DEFAULT_FRAME_HEIGHT: u32 = 480;

// capture devices the software runtime exposes unless told otherwise
pub const DEFAULT_DEVICES: &[&str] = &["/dev/video0", "/dev/video1"];

// streaming
pub const DEFAULT_STREAM_HOST: &str = "127.0.0.1";
pub const DEFAULT_STREAM_PORT: u16 = 5000;

// software runtime
pub const STAGE_WORKER_THREADS: usize = 2;
pub const FRAME_QUEUE_DEPTH: usize = 16;
pub const FILE_CHUNK_SIZE: usize = 4096;
pub const KEYFRAME_INTERVAL: u64 = 30;
pub const WORKER_STOP_TIMEOUT_MS: u64 = 2000;
pub const CLIENT_WRITE_TIMEOUT_MS: u64 = 500;

// media runtime the shell starts unless told otherwise
#[cfg(feature = "gstreamer")]
pub const DEFAULT_RUNTIME: &str = "gstreamer";
#[cfg(not(feature = "gstreamer"))]
pub const DEFAULT_RUNTIME: &str = "soft";

// controller
pub const TRANSITION_TIMEOUT_MS: u64 = 5000;
pub const STATE_POLL_INTERVAL_MS: u64 = 10;
pub const HEALTH_REPORT_INTERVAL_SECS: u64 = 10;

#[cfg(target_os = "windows")]
pub const TARGET_OS: &str = "windows";
#[cfg(target_os = "macos")]
pub const TARGET_OS: &str = "macos";
#[cfg(target_os = "linux")]
pub const TARGET_OS: &str = "linux";
#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
pub const TARGET_OS: &str = "other";
