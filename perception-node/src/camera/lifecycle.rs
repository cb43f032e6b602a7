use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{
    DepthData, DeviceStatus, ExposureMode, FrameBuffer, FrameConverter, SensorDevice,
    SensorFactory,
};
use crate::config::SensorConfig;
use crate::error::{PerceptionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Uninitialized,
    Initializing,
    Ready,
    Capturing,
    Failed,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    None,
    Started,
    StartFailed,
    /// Capture stopped; `reinitialized` tells whether the warm re-init succeeded.
    Stopped { reinitialized: bool },
    StopFailed,
    InitializeFailed,
}

/// Owns the sensor handle and drives it between ready and capturing.
///
/// Only the processing thread calls into this type; the sensor's own thread
/// touches nothing but the frame callback registered in [`initialize`].
///
/// [`initialize`]: CameraController::initialize
pub struct CameraController {
    factory: Box<dyn SensorFactory>,
    device: Option<Box<dyn SensorDevice>>,
    state: CameraState,
    config: SensorConfig,
    buffer: Arc<FrameBuffer>,
    frame_rate: u16,
    sensor_size: (usize, usize),
}

impl CameraController {
    pub fn new(
        factory: Box<dyn SensorFactory>,
        config: SensorConfig,
        buffer: Arc<FrameBuffer>,
    ) -> Self {
        Self {
            factory,
            device: None,
            state: CameraState::Uninitialized,
            config,
            buffer,
            frame_rate: 0,
            sensor_size: (0, 0),
        }
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn frame_rate(&self) -> u16 {
        self.frame_rate
    }

    pub fn sensor_size(&self) -> (usize, usize) {
        self.sensor_size
    }

    pub fn is_capturing(&self) -> bool {
        match self.device.as_ref().map(|d| d.is_capturing()) {
            Some(Ok(capturing)) => capturing,
            Some(Err(e)) => {
                warn!("Failed to query capture state: {}", e);
                false
            }
            None => false,
        }
    }

    /// Opens and configures the sensor, replacing any previous handle.
    #[instrument(skip(self), fields(use_case = %self.config.use_case))]
    pub fn initialize(&mut self) -> Result<()> {
        self.state = CameraState::Initializing;
        self.release_device();

        match self.configure_device() {
            Ok(device) => {
                self.device = Some(device);
                self.state = CameraState::Ready;
                info!(
                    "ToF sensor ready: {}x{} @ {} fps",
                    self.sensor_size.0, self.sensor_size.1, self.frame_rate
                );
                Ok(())
            }
            Err(e) => {
                self.state = CameraState::Failed;
                Err(e)
            }
        }
    }

    fn configure_device(&mut self) -> Result<Box<dyn SensorDevice>> {
        let mut device = self
            .factory
            .open()
            .ok_or_else(|| PerceptionError::DeviceNotFound("no ToF sensor detected".to_string()))?;

        device
            .initialize()
            .map_err(|e| PerceptionError::InitializationFailed(e.to_string()))?;

        let use_cases = device
            .use_cases()
            .map_err(|e| PerceptionError::InitializationFailed(e.to_string()))?;
        if !use_cases.iter().any(|u| *u == self.config.use_case) {
            return Err(PerceptionError::UseCaseUnavailable(format!(
                "{} (available: {})",
                self.config.use_case,
                use_cases.join(", ")
            )));
        }
        device
            .set_use_case(&self.config.use_case)
            .map_err(|e| PerceptionError::UseCaseUnavailable(format!("{}: {}", self.config.use_case, e)))?;

        self.frame_rate = device
            .frame_rate()
            .map_err(|e| PerceptionError::InitializationFailed(e.to_string()))?;
        self.sensor_size = device
            .sensor_size()
            .map_err(|e| PerceptionError::InitializationFailed(e.to_string()))?;

        self.configure_exposure(device.as_mut())?;
        self.apply_processing_parameters(device.as_mut())?;

        let converter = FrameConverter::new(
            self.sensor_size.0,
            self.sensor_size.1,
            self.config.conversion.clone(),
        );
        let buffer = Arc::clone(&self.buffer);
        device
            .register_frame_callback(Box::new(move |data: &DepthData| {
                match converter.convert(data) {
                    Some(frame) => buffer.push(frame),
                    None => warn!(
                        "Dropping {}x{} frame, sensor resolution is {:?}",
                        data.width,
                        data.height,
                        converter.dimensions()
                    ),
                }
            }))
            .map_err(|e| PerceptionError::InitializationFailed(e.to_string()))?;

        Ok(device)
    }

    fn configure_exposure(&self, device: &mut dyn SensorDevice) -> Result<()> {
        if self.config.exposure_time_us == 0 {
            device
                .set_exposure_mode(ExposureMode::Automatic)
                .map_err(|e| PerceptionError::InitializationFailed(e.to_string()))?;
            debug!("Exposure mode: automatic");
            return Ok(());
        }

        device
            .set_exposure_mode(ExposureMode::Manual)
            .map_err(|e| PerceptionError::InitializationFailed(e.to_string()))?;
        self.set_exposure_on(device, self.config.exposure_time_us)
    }

    fn apply_processing_parameters(&self, device: &mut dyn SensorDevice) -> Result<()> {
        let mut parameters = device
            .processing_parameters()
            .map_err(|e| PerceptionError::ParameterRejected(e.to_string()))?;

        let overrides = self.config.processing.overrides();
        for (flag, value) in parameters.iter_mut() {
            if let Some((_, new_value)) = overrides.iter().find(|(f, _)| f == flag) {
                *value = *new_value;
            }
        }

        device
            .set_processing_parameters(&parameters)
            .map_err(|e| PerceptionError::ParameterRejected(e.to_string()))
    }

    /// Sets a manual exposure time, retrying while the device reports busy.
    pub fn set_exposure_time_with_retry(&mut self, exposure_us: u32) -> Result<()> {
        let mut device = self
            .device
            .take()
            .ok_or_else(|| PerceptionError::CameraError("sensor not initialized".to_string()))?;
        let result = self.set_exposure_on(device.as_mut(), exposure_us);
        self.device = Some(device);
        result
    }

    fn set_exposure_on(&self, device: &mut dyn SensorDevice, exposure_us: u32) -> Result<()> {
        let (min, max) = device
            .exposure_limits()
            .map_err(|e| PerceptionError::CameraError(format!("exposure limits: {}", e)))?;
        let exposure = exposure_us.clamp(min, max);
        if exposure != exposure_us {
            warn!(
                "Exposure {}us outside [{}, {}], using {}us",
                exposure_us, min, max, exposure
            );
        }

        let backoff = Duration::from_millis(
            self.config.exposure_retry_backoff_ms / u64::from(self.frame_rate.max(1)),
        );
        let attempts = self.config.exposure_retry_count.max(1);
        for attempt in 1..=attempts {
            thread::sleep(backoff);
            match device.set_exposure_time(exposure) {
                Ok(()) => {
                    debug!("Exposure set to {}us after {} attempt(s)", exposure, attempt);
                    return Ok(());
                }
                Err(DeviceStatus::Busy) => {
                    debug!("Device busy setting exposure (attempt {}/{})", attempt, attempts);
                }
                Err(e) => {
                    return Err(PerceptionError::CameraError(format!(
                        "set exposure time: {}",
                        e
                    )))
                }
            }
        }

        Err(PerceptionError::ExposureRetriesExhausted {
            attempts,
            reason: DeviceStatus::Busy.to_string(),
        })
    }

    /// Brings the capture state in line with `streaming`. Never fails; problems
    /// are logged and retried on the next call.
    pub fn reconcile(&mut self, streaming: bool) -> ReconcileAction {
        let capturing = self.is_capturing();

        if !streaming && capturing {
            return self.stop_and_rewarm();
        }

        if streaming && !capturing {
            if matches!(self.state, CameraState::Failed | CameraState::Uninitialized) {
                if let Err(e) = self.initialize() {
                    warn!("Sensor re-initialization failed: {}", e);
                    return ReconcileAction::InitializeFailed;
                }
            }
            return self.start();
        }

        if streaming && self.state == CameraState::Ready {
            self.state = CameraState::Capturing;
        }
        ReconcileAction::None
    }

    fn start(&mut self) -> ReconcileAction {
        let Some(device) = self.device.as_mut() else {
            return ReconcileAction::StartFailed;
        };
        match device.start_capture() {
            Ok(()) => {
                self.state = CameraState::Capturing;
                info!("ToF capture started");
                ReconcileAction::Started
            }
            Err(e) => {
                warn!("Failed to start capture: {}", e);
                ReconcileAction::StartFailed
            }
        }
    }

    /// Stops capture and immediately re-initializes so that the next start
    /// skips the sensor's cold boot.
    fn stop_and_rewarm(&mut self) -> ReconcileAction {
        let Some(device) = self.device.as_mut() else {
            return ReconcileAction::StopFailed;
        };
        if let Err(e) = device.stop_capture() {
            warn!("Failed to stop capture: {}", e);
            return ReconcileAction::StopFailed;
        }
        self.state = CameraState::Ready;
        info!("ToF capture stopped, re-initializing sensor");

        let reinitialized = match self.initialize() {
            Ok(()) => true,
            Err(e) => {
                warn!("Sensor re-initialization after stop failed: {}", e);
                false
            }
        };
        ReconcileAction::Stopped { reinitialized }
    }

    fn release_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            if matches!(device.is_capturing(), Ok(true)) {
                if let Err(e) = device.stop_capture() {
                    warn!("Failed to stop capture while releasing sensor: {}", e);
                }
            }
        }
    }

    /// Stops capture and releases the sensor.
    pub fn shutdown(&mut self) {
        self.release_device();
        self.state = CameraState::Uninitialized;
        info!("ToF sensor released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mock::{MockHandle, MockScript, MockSensorFactory};
    use crate::camera::{ParameterValue, ProcessingFlag};

    fn controller(script: MockScript, config: SensorConfig) -> (CameraController, MockHandle, Arc<FrameBuffer>) {
        let factory = MockSensorFactory::new(MockScript {
            generate_frames: false,
            ..script
        });
        let handle = factory.handle();
        let buffer = Arc::new(FrameBuffer::new());
        let controller = CameraController::new(Box::new(factory), config, Arc::clone(&buffer));
        (controller, handle, buffer)
    }

    fn fast_config() -> SensorConfig {
        SensorConfig {
            exposure_retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_initialize_configures_sensor() {
        let (mut camera, handle, _) = controller(MockScript::default(), fast_config());
        camera.initialize().unwrap();

        assert_eq!(camera.state(), CameraState::Ready);
        assert_eq!(handle.use_case().as_deref(), Some("MODE_9_5FPS"));
        assert_eq!(handle.exposure(), (ExposureMode::Automatic, None));
        assert_eq!(camera.sensor_size(), (224, 172));

        let parameters = handle.parameters();
        assert!(parameters.contains(&(ProcessingFlag::UseRemoveStrayLight, ParameterValue::Bool(true))));
        assert!(parameters.contains(&(ProcessingFlag::GlobalBinning, ParameterValue::Int(2))));
        // Device entries without an override keep their value.
        assert!(parameters.contains(&(ProcessingFlag::UseHoleFilling, ParameterValue::Bool(true))));
    }

    #[test]
    fn test_initialize_failures_are_fatal() {
        let cases = [
            MockScript { absent: true, ..Default::default() },
            MockScript { fail_initialize: true, ..Default::default() },
            MockScript { use_cases: vec!["MODE_5_45FPS".to_string()], ..Default::default() },
            MockScript { reject_parameters: true, ..Default::default() },
        ];
        let mut errors = Vec::new();
        for script in cases {
            let (mut camera, _, _) = controller(script, fast_config());
            let err = camera.initialize().unwrap_err();
            assert_eq!(camera.state(), CameraState::Failed);
            assert!(err.is_fatal(), "{} should be fatal", err);
            errors.push(err);
        }
        assert!(matches!(errors[0], PerceptionError::DeviceNotFound(_)));
        assert!(matches!(errors[1], PerceptionError::InitializationFailed(_)));
        assert!(matches!(errors[2], PerceptionError::UseCaseUnavailable(_)));
        assert!(matches!(errors[3], PerceptionError::ParameterRejected(_)));
    }

    #[test]
    fn test_manual_exposure_is_clamped() {
        let config = SensorConfig {
            exposure_time_us: 5000,
            ..fast_config()
        };
        let (mut camera, handle, _) = controller(MockScript::default(), config);
        camera.initialize().unwrap();
        assert_eq!(handle.exposure(), (ExposureMode::Manual, Some(1880)));
    }

    #[test]
    fn test_exposure_retry_on_busy() {
        let (mut camera, handle, _) = controller(MockScript::default(), fast_config());
        camera.initialize().unwrap();

        handle.update_script(|s| s.exposure_busy_count = 2);
        camera.set_exposure_time_with_retry(300).unwrap();
        assert_eq!(handle.calls().set_exposure_time, 3);
        assert_eq!(handle.exposure().1, Some(300));

        handle.update_script(|s| s.exposure_busy_count = 10);
        let err = camera.set_exposure_time_with_retry(400).unwrap_err();
        assert!(matches!(err, PerceptionError::ExposureRetriesExhausted { attempts: 5, .. }));
        assert!(!err.is_fatal());
        assert_eq!(handle.calls().set_exposure_time, 8);
    }

    #[test]
    fn test_reconcile_start_stop_cycle() {
        let (mut camera, handle, _) = controller(MockScript::default(), fast_config());
        camera.initialize().unwrap();

        assert_eq!(camera.reconcile(false), ReconcileAction::None);
        assert_eq!(camera.reconcile(true), ReconcileAction::Started);
        assert_eq!(camera.reconcile(true), ReconcileAction::None);
        assert_eq!(camera.state(), CameraState::Capturing);
        assert_eq!(handle.calls().start_capture, 1);

        assert_eq!(camera.reconcile(false), ReconcileAction::Stopped { reinitialized: true });
        assert_eq!(camera.state(), CameraState::Ready);
        assert!(!handle.is_capturing());

        let calls = handle.calls();
        assert_eq!(calls.stop_capture, 1);
        assert_eq!(calls.initialize, 2);

        // Stop while already stopped changes nothing.
        assert_eq!(camera.reconcile(false), ReconcileAction::None);
        assert_eq!(handle.calls().stop_capture, 1);
    }

    #[test]
    fn test_start_failure_retries_next_pass() {
        let (mut camera, handle, _) = controller(
            MockScript {
                start_failures: 1,
                ..Default::default()
            },
            fast_config(),
        );
        camera.initialize().unwrap();

        assert_eq!(camera.reconcile(true), ReconcileAction::StartFailed);
        assert_eq!(camera.state(), CameraState::Ready);
        assert_eq!(camera.reconcile(true), ReconcileAction::Started);
        assert_eq!(handle.calls().start_capture, 2);
    }

    #[test]
    fn test_failed_sensor_is_reinitialized_before_start() {
        let (mut camera, handle, _) = controller(
            MockScript {
                fail_initialize: true,
                ..Default::default()
            },
            fast_config(),
        );
        assert!(camera.initialize().is_err());
        assert_eq!(camera.reconcile(true), ReconcileAction::InitializeFailed);

        handle.update_script(|s| s.fail_initialize = false);
        assert_eq!(camera.reconcile(true), ReconcileAction::Started);
        assert_eq!(camera.state(), CameraState::Capturing);
    }

    #[test]
    fn test_callback_pushes_frames() {
        let (mut camera, handle, buffer) = controller(MockScript::default(), fast_config());
        camera.initialize().unwrap();

        assert!(handle.emit(&handle.synthetic_frame(1_000)));
        let frame = buffer.take_latest_and_clear(Duration::from_millis(10)).unwrap();
        assert_eq!((frame.width(), frame.height()), (224, 172));
        assert_eq!(frame.sensor_timestamp, 1);
    }

    #[test]
    fn test_shutdown_stops_capture() {
        let (mut camera, handle, _) = controller(MockScript::default(), fast_config());
        camera.initialize().unwrap();
        camera.reconcile(true);
        camera.shutdown();
        assert!(!handle.is_capturing());
        assert_eq!(camera.state(), CameraState::Uninitialized);
    }
}
