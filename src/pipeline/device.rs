//! Capture device selection
//!
//! This module provides the `DeviceSelector` trait for choosing which
//! capture device feeds the pipeline.

use anyhow::{Result, bail};
use log::info;

use crate::pipeline::controller::PipelineController;
use crate::runtime::MediaRuntime;

/// Trait for selecting a capture device.
///
/// Implementations enumerate the devices that are present and switch the
/// capture source to one of them.
pub trait DeviceSelector {
    type Device: ToString + Eq + Send;

    /// Returns a list of available capture devices.
    fn available_devices(&mut self) -> Result<Vec<Self::Device>>;

    /// Selects a device for capture.
    fn select_device(&mut self, device: &Self::Device) -> Result<()>;

    /// Returns the currently selected device, if any.
    fn selected_device(&self) -> Result<Option<Self::Device>>;
}

impl<R: MediaRuntime> DeviceSelector for PipelineController<R> {
    type Device = String;

    fn available_devices(&mut self) -> Result<Vec<String>> {
        Ok(self.runtime().devices())
    }

    /// Switch the running pipeline to `device`, rebuilding it in place
    fn select_device(&mut self, device: &String) -> Result<()> {
        if !self.runtime().devices().contains(device) {
            bail!("capture device '{}' is not available", device);
        }
        if self.device() == Some(device.as_str()) {
            info!("capture device {} already selected", device);
            return Ok(());
        }
        self.switch_device(device)?;
        Ok(())
    }

    fn selected_device(&self) -> Result<Option<String>> {
        Ok(self.device().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::pipeline::descriptor::{StageDescriptor, Topology};
    use crate::pipeline::state::PipelineState;
    use crate::runtime::SoftRuntime;

    #[test]
    fn test_select_device() {
        let runtime = SoftRuntime::with_devices(["/dev/video0", "/dev/video2"]).unwrap();
        let mut controller = PipelineController::new(runtime, ControllerConfig::default());

        assert_eq!(
            controller.available_devices().unwrap(),
            vec!["/dev/video0".to_string(), "/dev/video2".to_string()]
        );
        assert_eq!(controller.selected_device().unwrap(), None);

        controller
            .build(
                vec![
                    StageDescriptor::device_source("cam", "/dev/video0"),
                    StageDescriptor::null_sink("out"),
                ],
                Topology::Linear,
            )
            .unwrap();
        controller.request_transition(PipelineState::Ready).unwrap();

        controller.select_device(&"/dev/video2".to_string()).unwrap();
        assert_eq!(
            controller.selected_device().unwrap(),
            Some("/dev/video2".to_string())
        );
        assert_eq!(controller.state(), PipelineState::Ready);

        assert!(controller.select_device(&"/dev/video9".to_string()).is_err());
        assert_eq!(controller.state(), PipelineState::Ready);
    }
}
