//! Hardware-free sensor driver.
//!
//! Produces a synthetic scene (a flat background with one near, bright
//! square) at the use-case frame rate, and lets tests script driver
//! failures: missing use cases, rejected parameters, busy exposure calls,
//! failing capture starts or an absent device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use super::{
    DepthData, DepthPoint, DeviceResult, DeviceStatus, ExposureMode, FrameCallback,
    ParameterValue, ProcessingFlag, SensorDevice, SensorFactory,
};

#[derive(Debug, Clone)]
pub struct MockScript {
    pub width: usize,
    pub height: usize,
    pub frame_rate: u16,
    pub use_cases: Vec<String>,
    pub exposure_limits: (u32, u32),
    /// `open()` returns no device.
    pub absent: bool,
    pub fail_initialize: bool,
    pub reject_parameters: bool,
    /// Number of `set_exposure_time` calls answered with `Busy` before success.
    pub exposure_busy_count: u32,
    /// Number of `start_capture` calls that fail before success.
    pub start_failures: u32,
    /// Spawn a thread that feeds synthetic frames while capturing.
    pub generate_frames: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            width: 224,
            height: 172,
            frame_rate: 5,
            use_cases: vec![
                "MODE_9_5FPS".to_string(),
                "MODE_9_10FPS".to_string(),
                "MODE_5_45FPS".to_string(),
            ],
            exposure_limits: (8, 1880),
            absent: false,
            fail_initialize: false,
            reject_parameters: false,
            exposure_busy_count: 0,
            start_failures: 0,
            generate_frames: true,
        }
    }
}

/// Calls observed by the mock, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub open: u32,
    pub initialize: u32,
    pub start_capture: u32,
    pub stop_capture: u32,
    pub set_exposure_time: u32,
}

struct MockState {
    script: MockScript,
    calls: MockCalls,
    use_case: Option<String>,
    exposure_mode: ExposureMode,
    exposure_time: Option<u32>,
    parameters: Vec<(ProcessingFlag, ParameterValue)>,
}

/// Shared view of the mock, kept by tests after the device is handed over.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    capturing: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
}

impl MockHandle {
    fn new(script: MockScript) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script,
                calls: MockCalls::default(),
                use_case: None,
                exposure_mode: ExposureMode::Automatic,
                exposure_time: None,
                parameters: default_parameters(),
            })),
            capturing: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> MockCalls {
        self.state().calls.clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn use_case(&self) -> Option<String> {
        self.state().use_case.clone()
    }

    pub fn exposure(&self) -> (ExposureMode, Option<u32>) {
        let state = self.state();
        (state.exposure_mode, state.exposure_time)
    }

    pub fn parameters(&self) -> Vec<(ProcessingFlag, ParameterValue)> {
        self.state().parameters.clone()
    }

    pub fn update_script(&self, update: impl FnOnce(&mut MockScript)) {
        update(&mut self.state().script);
    }

    /// Delivers `data` through the registered callback on the caller's thread.
    pub fn emit(&self, data: &DepthData) -> bool {
        let mut callback = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        match callback.as_mut() {
            Some(cb) => {
                cb(data);
                true
            }
            None => false,
        }
    }

    pub fn synthetic_frame(&self, timestamp: u64) -> DepthData {
        let (width, height) = {
            let state = self.state();
            (state.script.width, state.script.height)
        };
        synthetic_scene(width, height, timestamp)
    }
}

fn default_parameters() -> Vec<(ProcessingFlag, ParameterValue)> {
    use ProcessingFlag::*;
    vec![
        (UseRemoveFlyingPixel, ParameterValue::Bool(true)),
        (UseRemoveStrayLight, ParameterValue::Bool(false)),
        (AdaptiveNoiseFilterType, ParameterValue::Int(1)),
        (NoiseThreshold, ParameterValue::Float(0.07)),
        (GlobalBinning, ParameterValue::Int(1)),
        (UseValidateImage, ParameterValue::Bool(true)),
        (UseHoleFilling, ParameterValue::Bool(true)),
        (AutoExposureRefValue, ParameterValue::Float(1000.0)),
    ]
}

/// Background plane at 1.5 m with a bright square at 0.6 m in the middle.
fn synthetic_scene(width: usize, height: usize, timestamp: u64) -> DepthData {
    let mut points = Vec::with_capacity(width * height);
    let (r0, r1) = (height * 2 / 5, height * 3 / 5);
    let (c0, c1) = (width * 2 / 5, width * 3 / 5);
    for row in 0..height {
        for col in 0..width {
            let u = (col as f32 - width as f32 / 2.0) / width as f32;
            let v = (row as f32 - height as f32 / 2.0) / height as f32;
            let near = (r0..r1).contains(&row) && (c0..c1).contains(&col);
            let (z, noise, gray_value) = if near {
                (0.6, 0.001, 900)
            } else {
                (1.5, 0.02, 150)
            };
            points.push(DepthPoint {
                x: u * z,
                y: v * z,
                z,
                noise,
                gray_value,
            });
        }
    }
    DepthData {
        timestamp,
        width,
        height,
        points,
    }
}

pub struct MockSensorDevice {
    handle: MockHandle,
    generator: Option<JoinHandle<()>>,
}

impl MockSensorDevice {
    pub fn new(handle: MockHandle) -> Self {
        Self {
            handle,
            generator: None,
        }
    }

    fn spawn_generator(&mut self) -> DeviceResult<()> {
        let (generate, frame_rate) = {
            let state = self.handle.state();
            (state.script.generate_frames, state.script.frame_rate.max(1))
        };
        if !generate {
            return Ok(());
        }

        let handle = self.handle.clone();
        let interval = Duration::from_secs_f64(1.0 / frame_rate as f64);
        let generator = thread::Builder::new()
            .name("mock-tof".to_string())
            .spawn(move || {
                let mut timestamp = 0u64;
                while handle.is_capturing() {
                    let data = handle.synthetic_frame(timestamp);
                    handle.emit(&data);
                    timestamp += interval.as_micros() as u64;
                    thread::sleep(interval);
                }
                debug!("Mock frame generator stopped");
            })
            .map_err(|e| DeviceStatus::Other(format!("failed to spawn generator: {}", e)))?;
        self.generator = Some(generator);
        Ok(())
    }

    fn join_generator(&mut self) {
        if let Some(generator) = self.generator.take() {
            let _ = generator.join();
        }
    }
}

impl SensorDevice for MockSensorDevice {
    fn initialize(&mut self) -> DeviceResult<()> {
        let mut state = self.handle.state();
        state.calls.initialize += 1;
        if state.script.fail_initialize {
            return Err(DeviceStatus::Other("mock initialize failure".to_string()));
        }
        Ok(())
    }

    fn use_cases(&self) -> DeviceResult<Vec<String>> {
        Ok(self.handle.state().script.use_cases.clone())
    }

    fn set_use_case(&mut self, name: &str) -> DeviceResult<()> {
        let mut state = self.handle.state();
        if !state.script.use_cases.iter().any(|u| u == name) {
            return Err(DeviceStatus::NotSupported);
        }
        state.use_case = Some(name.to_string());
        Ok(())
    }

    fn set_exposure_mode(&mut self, mode: ExposureMode) -> DeviceResult<()> {
        self.handle.state().exposure_mode = mode;
        Ok(())
    }

    fn exposure_limits(&self) -> DeviceResult<(u32, u32)> {
        Ok(self.handle.state().script.exposure_limits)
    }

    fn set_exposure_time(&mut self, exposure_us: u32) -> DeviceResult<()> {
        let mut state = self.handle.state();
        state.calls.set_exposure_time += 1;
        if state.script.exposure_busy_count > 0 {
            state.script.exposure_busy_count -= 1;
            return Err(DeviceStatus::Busy);
        }
        state.exposure_time = Some(exposure_us);
        Ok(())
    }

    fn processing_parameters(&self) -> DeviceResult<Vec<(ProcessingFlag, ParameterValue)>> {
        Ok(self.handle.state().parameters.clone())
    }

    fn set_processing_parameters(
        &mut self,
        parameters: &[(ProcessingFlag, ParameterValue)],
    ) -> DeviceResult<()> {
        let mut state = self.handle.state();
        if state.script.reject_parameters {
            return Err(DeviceStatus::Other("mock parameter rejection".to_string()));
        }
        state.parameters = parameters.to_vec();
        Ok(())
    }

    fn register_frame_callback(&mut self, callback: FrameCallback) -> DeviceResult<()> {
        *self
            .handle
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
        Ok(())
    }

    fn start_capture(&mut self) -> DeviceResult<()> {
        {
            let mut state = self.handle.state();
            state.calls.start_capture += 1;
            if state.script.start_failures > 0 {
                state.script.start_failures -= 1;
                return Err(DeviceStatus::Busy);
            }
        }
        if self.handle.capturing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.spawn_generator()
    }

    fn stop_capture(&mut self) -> DeviceResult<()> {
        self.handle.state().calls.stop_capture += 1;
        self.handle.capturing.store(false, Ordering::SeqCst);
        self.join_generator();
        Ok(())
    }

    fn is_capturing(&self) -> DeviceResult<bool> {
        Ok(self.handle.is_capturing())
    }

    fn sensor_size(&self) -> DeviceResult<(usize, usize)> {
        let state = self.handle.state();
        Ok((state.script.width, state.script.height))
    }

    fn frame_rate(&self) -> DeviceResult<u16> {
        Ok(self.handle.state().script.frame_rate)
    }
}

impl Drop for MockSensorDevice {
    fn drop(&mut self) {
        self.handle.capturing.store(false, Ordering::SeqCst);
        self.join_generator();
    }
}

pub struct MockSensorFactory {
    handle: MockHandle,
}

impl MockSensorFactory {
    pub fn new(script: MockScript) -> Self {
        Self {
            handle: MockHandle::new(script),
        }
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl Default for MockSensorFactory {
    fn default() -> Self {
        Self::new(MockScript::default())
    }
}

impl SensorFactory for MockSensorFactory {
    fn open(&mut self) -> Option<Box<dyn SensorDevice>> {
        {
            let mut state = self.handle.state();
            state.calls.open += 1;
            if state.script.absent {
                return None;
            }
        }
        info!("Opened mock ToF sensor");
        Some(Box::new(MockSensorDevice::new(self.handle.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_feeds_callback_while_capturing() {
        let mut factory = MockSensorFactory::new(MockScript {
            width: 8,
            height: 6,
            frame_rate: 100,
            ..Default::default()
        });
        let handle = factory.handle();
        let mut device = factory.open().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        device
            .register_frame_callback(Box::new(move |data: &DepthData| {
                sink.lock().unwrap().push(data.points.len());
            }))
            .unwrap();

        device.start_capture().unwrap();
        thread::sleep(Duration::from_millis(100));
        device.stop_capture().unwrap();

        assert!(!handle.is_capturing());
        let received = received.lock().unwrap();
        assert!(!received.is_empty());
        assert!(received.iter().all(|&n| n == 48));
    }

    #[test]
    fn test_scripted_failures() {
        let mut factory = MockSensorFactory::new(MockScript {
            exposure_busy_count: 2,
            start_failures: 1,
            generate_frames: false,
            ..Default::default()
        });
        let mut device = factory.open().unwrap();

        assert_eq!(device.set_exposure_time(100), Err(DeviceStatus::Busy));
        assert_eq!(device.set_exposure_time(100), Err(DeviceStatus::Busy));
        assert_eq!(device.set_exposure_time(100), Ok(()));
        assert_eq!(device.start_capture(), Err(DeviceStatus::Busy));
        assert_eq!(device.start_capture(), Ok(()));
        assert_eq!(device.set_use_case("MODE_X"), Err(DeviceStatus::NotSupported));
    }

    #[test]
    fn test_absent_device() {
        let mut factory = MockSensorFactory::new(MockScript {
            absent: true,
            ..Default::default()
        });
        assert!(factory.open().is_none());
        assert_eq!(factory.handle().calls().open, 1);
    }
}
