//! In-process software runtime
//!
//! Implements the [`MediaRuntime`] seam without any native media framework:
//! sources synthesize or read buffers, transforms rewrite them, and sinks
//! render (count), discard, or serve them over TCP. Each activated stage runs
//! as a task on a runtime-owned worker pool, so stage processing never runs on
//! the controller thread.
//!
//! The runtime also plays the part of the operating system for capture
//! devices: it knows which device paths are present, hands out exclusive
//! leases, and lets a shell (or a test) unplug a device or inject runtime
//! faults.

mod stage;

use log::{debug, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::assets::{DEFAULT_DEVICES, STAGE_WORKER_THREADS};
use crate::pipeline::descriptor::StageDescriptor;
use crate::runtime::{BusHandle, BusMessage, MediaRuntime, StageError, lock};

pub use stage::{SoftStage, StageStats};

use stage::Shared;

/// Capture devices known to the runtime and the leases held on them
#[derive(Debug, Default)]
pub(crate) struct DeviceTable {
    present: Mutex<BTreeSet<String>>,
    leased: Mutex<HashSet<String>>,
}

impl DeviceTable {
    pub(crate) fn is_present(&self, device: &str) -> bool {
        lock(&self.present).contains(device)
    }

    fn acquire(&self, device: &str) -> Result<(), StageError> {
        if !self.is_present(device) {
            return Err(StageError::DeviceMissing(device.to_string()));
        }
        let mut leased = lock(&self.leased);
        if !leased.insert(device.to_string()) {
            return Err(StageError::DeviceBusy(device.to_string()));
        }
        debug!("device {} leased", device);
        Ok(())
    }

    fn release(&self, device: &str) {
        if lock(&self.leased).remove(device) {
            debug!("device {} released", device);
        }
    }
}

pub(crate) struct Inner {
    workers: Option<tokio::runtime::Runtime>,
    handle: tokio::runtime::Handle,
    devices: Arc<DeviceTable>,
    stages: Mutex<Vec<Weak<Shared>>>,
    released: Mutex<Vec<String>>,
    live: AtomicUsize,
}

impl Inner {
    fn record_release(&self, name: &str) {
        lock(&self.released).push(name.to_string());
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown_background();
        }
    }
}

/// Software implementation of [`MediaRuntime`]
///
/// Cloning yields another handle to the same runtime: the same worker pool,
/// device table and lease set. Controllers that must not share a device
/// should share a runtime.
#[derive(Clone)]
pub struct SoftRuntime {
    inner: Arc<Inner>,
}

impl SoftRuntime {
    /// Create a runtime with the default device set
    pub fn new() -> std::io::Result<Self> {
        Self::with_devices(DEFAULT_DEVICES.iter().copied())
    }

    /// Create a runtime exposing exactly the given capture devices
    pub fn with_devices<I, S>(devices: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let workers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(STAGE_WORKER_THREADS)
            .thread_name("camcast-stage")
            .enable_all()
            .build()?;
        let handle = workers.handle().clone();

        let table = DeviceTable::default();
        lock(&table.present).extend(devices.into_iter().map(Into::into));

        Ok(Self {
            inner: Arc::new(Inner {
                workers: Some(workers),
                handle,
                devices: Arc::new(table),
                stages: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
            }),
        })
    }

    /// Make a capture device available
    pub fn plug(&self, device: &str) {
        lock(&self.inner.devices.present).insert(device.to_string());
        info!("device {} plugged", device);
    }

    /// Remove a capture device. Sources reading it report an error on their
    /// next cycle.
    pub fn unplug(&self, device: &str) {
        lock(&self.inner.devices.present).remove(device);
        info!("device {} unplugged", device);
    }

    /// Whether some live stage currently holds `device`
    pub fn is_leased(&self, device: &str) -> bool {
        lock(&self.inner.devices.leased).contains(device)
    }

    /// Post an error-level message from every live stage named `stage`.
    /// Returns how many stages posted.
    pub fn inject_error(&self, stage: &str, message: &str, debug: Option<&str>) -> usize {
        self.inject(stage, |name| BusMessage::Error {
            stage: name.to_string(),
            message: message.to_string(),
            debug: debug.map(str::to_string),
        })
    }

    /// Post a warning-level message from every live stage named `stage`
    pub fn inject_warning(&self, stage: &str, message: &str) -> usize {
        self.inject(stage, |name| BusMessage::Warning {
            stage: name.to_string(),
            message: message.to_string(),
            debug: None,
        })
    }

    /// Post end-of-stream from every live stage named `stage`
    pub fn inject_eos(&self, stage: &str) -> usize {
        self.inject(stage, |name| BusMessage::Eos {
            stage: name.to_string(),
        })
    }

    fn inject<F>(&self, stage: &str, make: F) -> usize
    where
        F: Fn(&str) -> BusMessage,
    {
        let targets: Vec<Arc<Shared>> = lock(&self.inner.stages)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|shared| shared.name == stage && !shared.is_released())
            .collect();

        if targets.is_empty() {
            warn!("no live stage named '{}' to inject into", stage);
        }
        for shared in &targets {
            shared.bus.post(make(&shared.name));
        }
        targets.len()
    }

    /// Number of stages created and not yet released
    pub fn live_stages(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Names of released stages, in release order, draining the log
    pub fn take_release_log(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.inner.released))
    }

    /// Buffer counters of the live stage named `stage`
    pub fn stage_stats(&self, stage: &str) -> Option<StageStats> {
        lock(&self.inner.stages)
            .iter()
            .filter_map(Weak::upgrade)
            .find(|shared| shared.name == stage && !shared.is_released())
            .map(|shared| shared.stats())
    }
}

impl MediaRuntime for SoftRuntime {
    type Stage = SoftStage;

    fn create_stage(
        &self,
        descriptor: &StageDescriptor,
        bus: BusHandle,
    ) -> Result<SoftStage, StageError> {
        let stage = SoftStage::create(descriptor, bus, Arc::clone(&self.inner))?;

        let mut stages = lock(&self.inner.stages);
        stages.retain(|weak| weak.strong_count() > 0);
        stages.push(stage.shared_weak());
        self.inner.live.fetch_add(1, Ordering::SeqCst);

        debug!("created stage {} ({})", descriptor.name, descriptor.kind);
        Ok(stage)
    }

    fn link(&self, upstream: &mut SoftStage, downstream: &mut SoftStage) -> Result<(), StageError> {
        upstream.link_to(downstream)
    }

    fn devices(&self) -> Vec<String> {
        lock(&self.inner.devices.present).iter().cloned().collect()
    }
}
