//! Software stages and their worker tasks

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{DeviceTable, Inner};
use crate::assets::{
    CLIENT_WRITE_TIMEOUT_MS, DEFAULT_FRAMERATE, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH,
    DEFAULT_STREAM_HOST, DEFAULT_STREAM_PORT, FILE_CHUNK_SIZE, FRAME_QUEUE_DEPTH,
    KEYFRAME_INTERVAL, WORKER_STOP_TIMEOUT_MS,
};
use crate::pipeline::descriptor::{PropertyValue, StageDescriptor, StageKind};
use crate::pipeline::overlay::SurfaceHandle;
use crate::runtime::types::{Frame, Timestamp};
use crate::runtime::{BusHandle, Caps, Stage, StageError, StageState, lock};

/// Buffer counters of one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    /// Buffers produced (sources), forwarded (transforms) or consumed (sinks)
    pub buffers: u64,
    /// Buffers dropped because a downstream queue was full
    pub dropped: u64,
}

/// State shared between a stage and its worker task
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) bus: BusHandle,
    playing: AtomicBool,
    released: AtomicBool,
    window: Mutex<Option<SurfaceHandle>>,
    buffers: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn stats(&self) -> StageStats {
        StageStats {
            buffers: self.buffers.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn push(&self, outputs: &[mpsc::Sender<Frame>], frame: Frame) {
        for tx in outputs {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.buffers.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    Black,
    White,
    Smpte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkRole {
    Display,
    Network,
    Null,
}

/// Concrete behaviour selected from a descriptor's kind and properties
enum Element {
    TestSource {
        pattern: Pattern,
        num_buffers: Option<u64>,
    },
    DeviceSource {
        device: String,
    },
    FileSource {
        data: Bytes,
    },
    Convert,
    Scale {
        width: u32,
        height: u32,
    },
    Filter,
    Encode,
    Mux,
    Sink {
        role: SinkRole,
        host: String,
        port: u16,
    },
}

impl Element {
    fn src_caps(&self) -> Option<Caps> {
        match self {
            Element::TestSource { .. } | Element::DeviceSource { .. } => Some(Caps::RawVideo),
            Element::FileSource { .. } => Some(Caps::Any),
            Element::Convert | Element::Scale { .. } => Some(Caps::RawVideo),
            Element::Filter => Some(Caps::Any),
            Element::Encode => Some(Caps::EncodedVideo),
            Element::Mux => Some(Caps::Packetized),
            Element::Sink { .. } => None,
        }
    }

    fn sink_caps(&self) -> &'static [Caps] {
        match self {
            Element::TestSource { .. } | Element::DeviceSource { .. } | Element::FileSource { .. } => {
                &[]
            }
            Element::Convert | Element::Scale { .. } | Element::Encode => &[Caps::RawVideo],
            Element::Filter => &[Caps::Any],
            Element::Mux => &[Caps::EncodedVideo],
            Element::Sink { role, .. } => match role {
                SinkRole::Display => &[Caps::RawVideo],
                SinkRole::Network => &[Caps::EncodedVideo, Caps::Packetized],
                SinkRole::Null => &[Caps::Any],
            },
        }
    }

    fn is_source(&self) -> bool {
        self.sink_caps().is_empty()
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> StageError {
    StageError::InvalidProperty {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn int_property(
    descriptor: &StageDescriptor,
    key: &str,
    default: i64,
    range: std::ops::RangeInclusive<i64>,
) -> Result<i64, StageError> {
    let value = match descriptor.property(key) {
        None => return Ok(default),
        Some(PropertyValue::Int(v)) => *v,
        Some(PropertyValue::Float(v)) if v.fract() == 0.0 && v.abs() <= i64::MAX as f64 => *v as i64,
        Some(PropertyValue::Str(s)) => s
            .parse::<i64>()
            .map_err(|_| invalid(key, format!("'{}' is not an integer", s)))?,
        Some(other) => return Err(invalid(key, format!("expected integer, got {}", other))),
    };
    if !range.contains(&value) {
        return Err(invalid(
            key,
            format!("{} outside {}..={}", value, range.start(), range.end()),
        ));
    }
    Ok(value)
}

fn str_property<'a>(descriptor: &'a StageDescriptor, key: &str) -> Result<Option<&'a str>, StageError> {
    match descriptor.property(key) {
        None => Ok(None),
        Some(PropertyValue::Str(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(invalid(key, format!("expected string, got {}", other))),
    }
}

fn parse_state(key: &str, value: &str) -> Result<StageState, StageError> {
    match value.to_ascii_lowercase().as_str() {
        "null" => Ok(StageState::Null),
        "ready" => Ok(StageState::Ready),
        "paused" => Ok(StageState::Paused),
        "playing" => Ok(StageState::Playing),
        other => Err(invalid(key, format!("unknown state '{}'", other))),
    }
}

impl Element {
    fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, StageError> {
        let element = match descriptor.kind {
            StageKind::Source => {
                if let Some(device) = str_property(descriptor, "device")? {
                    Element::DeviceSource {
                        device: device.to_string(),
                    }
                } else if let Some(location) = str_property(descriptor, "location")? {
                    let data = std::fs::read(location)
                        .map_err(|e| invalid("location", format!("{}: {}", location, e)))?;
                    Element::FileSource {
                        data: Bytes::from(data),
                    }
                } else {
                    let pattern = match str_property(descriptor, "pattern")?.unwrap_or("smpte") {
                        "black" => Pattern::Black,
                        "white" => Pattern::White,
                        "smpte" => Pattern::Smpte,
                        other => return Err(invalid("pattern", format!("unknown pattern '{}'", other))),
                    };
                    let num_buffers = match descriptor.property("num-buffers") {
                        None => None,
                        Some(_) => Some(int_property(descriptor, "num-buffers", 0, 0..=i64::MAX)? as u64),
                    };
                    Element::TestSource {
                        pattern,
                        num_buffers,
                    }
                }
            }
            StageKind::Convert => Element::Convert,
            StageKind::Scale => Element::Scale {
                width: int_property(descriptor, "width", DEFAULT_FRAME_WIDTH as i64, 2..=8192)? as u32,
                height: int_property(descriptor, "height", DEFAULT_FRAME_HEIGHT as i64, 2..=8192)?
                    as u32,
            },
            StageKind::Filter => Element::Filter,
            StageKind::Encode => Element::Encode,
            StageKind::Mux => Element::Mux,
            StageKind::Sink => {
                let role = match str_property(descriptor, "role")?.unwrap_or("null") {
                    "display" => SinkRole::Display,
                    "network" => SinkRole::Network,
                    "null" => SinkRole::Null,
                    other => return Err(invalid("role", format!("unknown sink role '{}'", other))),
                };
                let host = str_property(descriptor, "host")?
                    .unwrap_or(DEFAULT_STREAM_HOST)
                    .to_string();
                let port = int_property(descriptor, "port", DEFAULT_STREAM_PORT as i64, 0..=65535)? as u16;
                Element::Sink { role, host, port }
            }
        };
        Ok(element)
    }
}

/// Worker task of an activated stage
struct Worker {
    cancel: CancellationToken,
    done: std::sync::mpsc::Receiver<()>,
}

impl Worker {
    fn spawn<F>(handle: &tokio::runtime::Handle, cancel: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done) = std::sync::mpsc::channel::<()>();
        handle.spawn(async move {
            task.await;
            drop(done_tx);
        });
        Self { cancel, done }
    }

    /// Cancel the task and wait until it has dropped its sockets and queues
    fn stop(self, name: &str) {
        self.cancel.cancel();
        let wait = Duration::from_millis(WORKER_STOP_TIMEOUT_MS);
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(wait) {
            warn!("{}: worker still running after {:?}", name, wait);
        }
    }
}

/// Stage of the [`super::SoftRuntime`]
pub struct SoftStage {
    shared: Arc<Shared>,
    kind: StageKind,
    element: Arc<Element>,
    input_tx: Option<mpsc::Sender<Frame>>,
    input_rx: Option<Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>>,
    outputs: Vec<mpsc::Sender<Frame>>,
    state: StageState,
    pending: Option<(StageState, Instant)>,
    state_delay: Duration,
    refused_state: Option<StageState>,
    framerate: u32,
    width: u32,
    height: u32,
    lease: Option<String>,
    worker: Option<Worker>,
    runtime: Arc<Inner>,
    released: bool,
}

impl SoftStage {
    pub(super) fn create(
        descriptor: &StageDescriptor,
        bus: BusHandle,
        runtime: Arc<Inner>,
    ) -> Result<Self, StageError> {
        let element = Element::from_descriptor(descriptor)?;
        let framerate = int_property(descriptor, "framerate", DEFAULT_FRAMERATE as i64, 1..=1000)? as u32;
        let width = int_property(descriptor, "width", DEFAULT_FRAME_WIDTH as i64, 2..=8192)? as u32;
        let height = int_property(descriptor, "height", DEFAULT_FRAME_HEIGHT as i64, 2..=8192)? as u32;
        let delay_ms = int_property(descriptor, "state-delay-ms", 0, 0..=600_000)? as u64;
        let refused_state = match str_property(descriptor, "fail-state")? {
            Some(value) => Some(parse_state("fail-state", value)?),
            None => None,
        };

        // Lease last so a property error above never strands a device.
        let lease = match &element {
            Element::DeviceSource { device } => {
                runtime.devices.acquire(device)?;
                Some(device.clone())
            }
            _ => None,
        };

        let (input_tx, input_rx) = if element.is_source() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
            (Some(tx), Some(Arc::new(tokio::sync::Mutex::new(rx))))
        };

        Ok(Self {
            shared: Arc::new(Shared {
                name: descriptor.name.clone(),
                bus,
                playing: AtomicBool::new(false),
                released: AtomicBool::new(false),
                window: Mutex::new(None),
                buffers: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            kind: descriptor.kind,
            element: Arc::new(element),
            input_tx,
            input_rx,
            outputs: Vec::new(),
            state: StageState::Null,
            pending: None,
            state_delay: Duration::from_millis(delay_ms),
            refused_state,
            framerate,
            width,
            height,
            lease,
            worker: None,
            runtime,
            released: false,
        })
    }

    pub(super) fn shared_weak(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Current buffer counters
    pub fn stats(&self) -> StageStats {
        self.shared.stats()
    }

    pub(super) fn link_to(&mut self, downstream: &mut SoftStage) -> Result<(), StageError> {
        let incompatible = || StageError::IncompatiblePads {
            upstream: self.shared.name.clone(),
            downstream: downstream.shared.name.clone(),
        };

        let offered = self.element.src_caps().ok_or_else(incompatible)?;
        let accepted = downstream.element.sink_caps();
        if !accepted.iter().any(|caps| caps.accepts(offered)) {
            debug!(
                "link {} -> {} refused: {} not in {:?}",
                self.shared.name, downstream.shared.name, offered, accepted
            );
            return Err(incompatible());
        }
        let tx = downstream.input_tx.clone().ok_or_else(incompatible)?;
        self.outputs.push(tx);
        Ok(())
    }

    fn settle(&mut self) {
        if let Some((target, at)) = self.pending
            && Instant::now() >= at
        {
            self.state = target;
            self.pending = None;
        }
    }

    fn requested_state(&self) -> StageState {
        self.pending.map(|(target, _)| target).unwrap_or(self.state)
    }

    fn activate(&mut self) -> Result<(), StageError> {
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let element = Arc::clone(&self.element);
        let handle = &self.runtime.handle;

        let worker = match element.as_ref() {
            Element::TestSource { .. } | Element::DeviceSource { .. } | Element::FileSource { .. } => {
                let source = SourceLoop {
                    shared,
                    element: Arc::clone(&element),
                    outputs: self.outputs.clone(),
                    devices: Arc::clone(&self.runtime.devices),
                    interval: Duration::from_secs_f64(1.0 / self.framerate as f64),
                    width: self.width,
                    height: self.height,
                };
                Worker::spawn(handle, cancel.clone(), source.run(cancel))
            }
            Element::Sink {
                role: SinkRole::Network,
                host,
                port,
            } => {
                let listener = std::net::TcpListener::bind((host.as_str(), *port)).map_err(|e| {
                    StageError::StateRefused {
                        state: StageState::Paused,
                        reason: format!("could not bind {}:{}: {}", host, port, e),
                    }
                })?;
                listener.set_nonblocking(true)?;
                if let Ok(addr) = listener.local_addr() {
                    info!("{}: serving stream on {}", shared.name, addr);
                }
                let input = self.input_rx.clone().ok_or_else(|| StageError::Unsupported(shared.name.clone()))?;
                Worker::spawn(handle, cancel.clone(), serve_network(shared, input, listener, cancel))
            }
            _ => {
                let input = self.input_rx.clone().ok_or_else(|| StageError::Unsupported(shared.name.clone()))?;
                let task = process_loop(shared, Arc::clone(&element), input, self.outputs.clone(), cancel.clone());
                Worker::spawn(handle, cancel, task)
            }
        };

        self.worker = Some(worker);
        Ok(())
    }

    /// Stop the worker. Returns once the task is gone, so a network sink's
    /// port can be bound again straight away.
    fn deactivate(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop(&self.shared.name);
        }
    }

    fn release_lease(&mut self) {
        if let Some(device) = self.lease.take() {
            self.runtime.devices.release(&device);
        }
    }
}

impl Stage for SoftStage {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn is_display_sink(&self) -> bool {
        matches!(
            self.element.as_ref(),
            Element::Sink {
                role: SinkRole::Display,
                ..
            }
        )
    }

    fn set_state(&mut self, target: StageState) -> Result<(), StageError> {
        if self.released {
            return Err(StageError::StateRefused {
                state: target,
                reason: "stage already released".to_string(),
            });
        }
        if self.refused_state == Some(target) {
            return Err(StageError::StateRefused {
                state: target,
                reason: "refused by configuration".to_string(),
            });
        }

        self.settle();
        let from = self.requested_state();
        if from == target {
            return Ok(());
        }

        if target > StageState::Null && self.lease.is_none() {
            if let Element::DeviceSource { device } = self.element.as_ref() {
                self.runtime.devices.acquire(device)?;
                self.lease = Some(device.clone());
            }
        }
        if from < StageState::Paused && target >= StageState::Paused {
            self.activate()?;
        }
        self.shared
            .playing
            .store(target == StageState::Playing, Ordering::SeqCst);
        if from >= StageState::Paused && target < StageState::Paused {
            self.deactivate();
        }
        if target == StageState::Null {
            self.release_lease();
        }

        if self.state_delay.is_zero() {
            self.state = target;
            self.pending = None;
        } else {
            self.pending = Some((target, Instant::now() + self.state_delay));
        }
        debug!("{}: {} -> {}", self.shared.name, from, target);
        Ok(())
    }

    fn current_state(&self) -> StageState {
        match self.pending {
            Some((target, at)) if Instant::now() >= at => target,
            _ => self.state,
        }
    }

    fn set_window_handle(&mut self, handle: Option<SurfaceHandle>) -> Result<(), StageError> {
        if !self.is_display_sink() {
            return Err(StageError::Unsupported(format!(
                "{} does not render into a window",
                self.shared.name
            )));
        }
        *lock(&self.shared.window) = handle;
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.deactivate();
        self.shared.playing.store(false, Ordering::SeqCst);
        self.shared.released.store(true, Ordering::SeqCst);
        *lock(&self.shared.window) = None;
        self.release_lease();
        self.outputs.clear();
        self.state = StageState::Null;
        self.pending = None;
        self.released = true;
        self.runtime.record_release(&self.shared.name);
        debug!("released stage {}", self.shared.name);
    }
}

impl Drop for SoftStage {
    fn drop(&mut self) {
        self.release();
    }
}

struct SourceLoop {
    shared: Arc<Shared>,
    element: Arc<Element>,
    outputs: Vec<mpsc::Sender<Frame>>,
    devices: Arc<DeviceTable>,
    interval: Duration,
    width: u32,
    height: u32,
}

impl SourceLoop {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        let base = Instant::now();
        let mut sequence = 0u64;
        let mut offset = 0usize;
        let picture = match self.element.as_ref() {
            Element::TestSource { pattern, .. } => test_picture(*pattern, self.width, self.height),
            _ => test_picture(Pattern::Black, self.width, self.height),
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Element::DeviceSource { device } = self.element.as_ref()
                && !self.devices.is_present(device)
            {
                self.shared.bus.error(
                    &self.shared.name,
                    "Could not read from resource.",
                    Some(format!("device {} disconnected", device)),
                );
                break;
            }

            if !self.shared.playing.load(Ordering::SeqCst) {
                continue;
            }

            let pts = Timestamp::from_instant(Instant::now(), base);
            let frame = match self.element.as_ref() {
                Element::TestSource { num_buffers, .. } => {
                    if num_buffers.is_some_and(|n| sequence >= n) {
                        self.shared.bus.eos(&self.shared.name);
                        break;
                    }
                    Frame::raw(picture.clone(), pts, sequence, self.width, self.height)
                }
                Element::FileSource { data } => {
                    if offset >= data.len() {
                        self.shared.bus.eos(&self.shared.name);
                        break;
                    }
                    let end = (offset + FILE_CHUNK_SIZE).min(data.len());
                    let mut frame = Frame::raw(data.slice(offset..end), pts, sequence, self.width, self.height);
                    frame.caps = Caps::Any;
                    offset = end;
                    frame
                }
                _ => Frame::raw(picture.clone(), pts, sequence, self.width, self.height),
            };
            sequence += 1;
            self.shared.push(&self.outputs, frame);
        }
        debug!("{}: source loop finished after {} buffers", self.shared.name, sequence);
    }
}

/// I420 picture for the given pattern
fn test_picture(pattern: Pattern, width: u32, height: u32) -> Bytes {
    let w = (width + (width % 2)) as usize;
    let h = (height + (height % 2)) as usize;
    let chroma = w * h / 4;
    let mut buf = BytesMut::with_capacity(w * h + chroma * 2);

    match pattern {
        Pattern::Black => {
            buf.put_bytes(16, w * h);
            buf.put_bytes(128, chroma * 2);
        }
        Pattern::White => {
            buf.put_bytes(235, w * h);
            buf.put_bytes(128, chroma * 2);
        }
        Pattern::Smpte => {
            const BARS: [u8; 7] = [235, 210, 170, 145, 106, 81, 41];
            for _ in 0..h {
                for x in 0..w {
                    buf.put_u8(BARS[x * BARS.len() / w]);
                }
            }
            buf.put_bytes(128, chroma * 2);
        }
    }
    buf.freeze()
}

fn transform(element: &Element, mut frame: Frame) -> Frame {
    match element {
        Element::Scale { width, height } => {
            frame.width = *width;
            frame.height = *height;
        }
        Element::Encode => {
            frame.caps = Caps::EncodedVideo;
            frame.is_keyframe = frame.sequence % KEYFRAME_INTERVAL == 0;
        }
        Element::Mux => {
            let mut packet = BytesMut::with_capacity(frame.data.len() + 12);
            packet.put_u8(0x80);
            packet.put_u8(96 | if frame.is_keyframe { 0x80 } else { 0 });
            packet.put_u16(frame.sequence as u16);
            packet.put_u32((frame.pts.as_duration().as_millis() as u32).wrapping_mul(90));
            packet.put_u32(0);
            packet.extend_from_slice(&frame.data);
            frame.data = packet.freeze();
            frame.caps = Caps::Packetized;
        }
        _ => {}
    }
    frame
}

async fn process_loop(
    shared: Arc<Shared>,
    element: Arc<Element>,
    input: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    outputs: Vec<mpsc::Sender<Frame>>,
    cancel: CancellationToken,
) {
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return,
        rx = input.lock() => rx,
    };
    let mut warned = false;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match element.as_ref() {
            Element::Sink {
                role: SinkRole::Display,
                ..
            } => {
                if lock(&shared.window).is_none() && !warned {
                    warned = true;
                    shared.bus.warning(
                        &shared.name,
                        "No window handle set, rendering into a default window",
                        None,
                    );
                }
                shared.buffers.fetch_add(1, Ordering::Relaxed);
            }
            Element::Sink { .. } => {
                shared.buffers.fetch_add(1, Ordering::Relaxed);
            }
            other => shared.push(&outputs, transform(other, frame)),
        }
    }
}

async fn write_frame(
    stream: &mut tokio::net::TcpStream,
    header: &[u8],
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(header).await?;
    stream.write_all(payload).await
}

async fn serve_network(
    shared: Arc<Shared>,
    input: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    listener: std::net::TcpListener,
    cancel: CancellationToken,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            shared.bus.error(
                &shared.name,
                "Could not open resource for writing.",
                Some(e.to_string()),
            );
            return;
        }
    };
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return,
        rx = input.lock() => rx,
    };
    let mut clients: Vec<(std::net::SocketAddr, tokio::net::TcpStream)> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("{}: client {} connected", shared.name, peer);
                    let _ = stream.set_nodelay(true);
                    clients.push((peer, stream));
                }
                Err(e) => {
                    shared.bus.warning(&shared.name, "Failed to accept client", Some(e.to_string()));
                }
            },
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                shared.buffers.fetch_add(1, Ordering::Relaxed);

                let mut header = [0u8; 4];
                header.copy_from_slice(&(frame.data.len() as u32).to_be_bytes());
                let mut alive = Vec::with_capacity(clients.len());
                let deadline = Duration::from_millis(CLIENT_WRITE_TIMEOUT_MS);
                for (peer, mut stream) in clients.drain(..) {
                    let written = tokio::time::timeout(deadline, write_frame(&mut stream, &header, &frame.data))
                        .await
                        .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()));
                    match written {
                        Ok(()) => alive.push((peer, stream)),
                        Err(e) => {
                            warn!("{}: dropping client {}: {}", shared.name, peer, e);
                            shared.bus.warning(
                                &shared.name,
                                "Client disconnected",
                                Some(format!("{}: {}", peer, e)),
                            );
                        }
                    }
                }
                clients = alive;
            }
        }
    }
    debug!("{}: network sink stopped", shared.name);
}
