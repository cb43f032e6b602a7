use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tof_common::Status;
use tracing::{debug, error, info, instrument, warn};

use super::detach::PidFile;
use super::instance_lock::InstanceLock;
use super::recorder::FrameRecorder;
use crate::camera::{CameraController, FrameBuffer, SensorFactory};
use crate::config::PerceptionConfig;
use crate::error::{PerceptionError, Result};
use crate::inference::Detector;
use crate::messaging::{CommandServer, StreamingState, ZmqPublisher};
use crate::processing::pipeline::collect_points;
use crate::processing::DetectionPipeline;
use crate::transform::CoordinateTransformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Result of one processing-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Not streaming; the buffer was cleared and the loop slept.
    Idle,
    /// Streaming, but no frame arrived within the bounded wait.
    NoFrame,
    DetectionFailed,
    PublishFailed,
    Published { points: usize, status: Status },
}

/// Everything the processing thread owns: the sensor, the detection chain and
/// the publish socket.
pub struct ProcessingLoop {
    camera: CameraController,
    pipeline: DetectionPipeline,
    buffer: Arc<FrameBuffer>,
    publisher: ZmqPublisher,
    recorder: Option<FrameRecorder>,
    streaming: StreamingState,
    frame_wait: Duration,
    idle_sleep: Duration,
}

impl ProcessingLoop {
    /// Reconciles the sensor with the streaming flag, then handles at most
    /// one frame. Never blocks longer than the frame wait or the idle sleep.
    pub fn run_once(&mut self) -> LoopOutcome {
        let streaming = self.streaming.is_streaming();
        self.camera.reconcile(streaming);

        if !streaming {
            // Drop anything left over so resuming never publishes a stale frame.
            self.buffer.clear();
            thread::sleep(self.idle_sleep);
            return LoopOutcome::Idle;
        }

        let Some(frame) = self.buffer.take_latest_and_clear(self.frame_wait) else {
            warn!("Streaming requested but no ToF frames are arriving");
            return LoopOutcome::NoFrame;
        };

        let objects = match self.pipeline.process(&frame) {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Detection failed: {}", e);
                return LoopOutcome::DetectionFailed;
            }
        };

        let (points, ids) = collect_points(&objects);
        let outcome = match self
            .publisher
            .publish(Status::Ok, frame.host_timestamp_ms, &points, &ids)
        {
            Ok(status) => LoopOutcome::Published {
                points: points.len(),
                status,
            },
            Err(e) => {
                warn!("Publish failed: {}", e);
                LoopOutcome::PublishFailed
            }
        };

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&frame);
        }
        outcome
    }

    /// Loops until `running` goes false, then hands itself back for shutdown.
    pub fn run(mut self, running: &AtomicBool) -> Self {
        info!("Processing thread started");
        while running.load(Ordering::SeqCst) {
            self.run_once();
        }
        info!(
            "Processing thread exiting after {} frames",
            self.pipeline.frames_processed()
        );
        self
    }

    pub fn camera(&self) -> &CameraController {
        &self.camera
    }

    pub fn shutdown(&mut self) {
        self.camera.shutdown();
    }
}

/// Owns the daemon's startup and shutdown ordering.
///
/// Startup takes the instance lock, prepares recording, opens both IPC
/// channels, loads the transform and initializes the sensor; any failure is
/// fatal. Shutdown is driven by the shared `running` flag.
pub struct DaemonSupervisor {
    state: DaemonState,
    running: Arc<AtomicBool>,
    streaming: StreamingState,
    worker: Option<JoinHandle<ProcessingLoop>>,
    command_server: Option<CommandServer>,
    lock: Option<InstanceLock>,
    pid_file: Option<PidFile>,
}

impl DaemonSupervisor {
    #[instrument(skip_all, fields(node = %config.node_id))]
    pub fn start(
        config: &PerceptionConfig,
        context: &zmq::Context,
        factory: Box<dyn SensorFactory>,
        detector: Box<dyn Detector>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        info!("Daemon starting");
        let lock = InstanceLock::acquire(&config.daemon.lock_file)?;
        let pid_file = config
            .daemon
            .pid_file
            .as_deref()
            .map(PidFile::create)
            .transpose()?;

        let recorder = if config.daemon.save_data {
            Some(FrameRecorder::create(&config.daemon.data_root)?)
        } else {
            None
        };

        let publisher = ZmqPublisher::new(context, &config.messaging)?;
        let streaming = StreamingState::new();
        let command_server =
            CommandServer::spawn(context, &config.messaging, streaming.clone(), running.clone())?;

        let processing = match Self::prepare_processing(config, factory, detector) {
            Ok(parts) => parts,
            Err(e) => {
                // Lets the command thread exit so it can be joined on drop.
                running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let (camera, pipeline, buffer) = processing;

        let processing_loop = ProcessingLoop {
            camera,
            pipeline,
            buffer,
            publisher,
            recorder,
            streaming: streaming.clone(),
            frame_wait: config.daemon.frame_wait(),
            idle_sleep: config.daemon.idle_sleep(),
        };

        let worker_running = running.clone();
        let worker = thread::Builder::new()
            .name("tof-processing".to_string())
            .spawn(move || processing_loop.run(&worker_running));
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        info!("Daemon running");
        Ok(Self {
            state: DaemonState::Running,
            running,
            streaming,
            worker: Some(worker),
            command_server: Some(command_server),
            lock: Some(lock),
            pid_file,
        })
    }

    fn prepare_processing(
        config: &PerceptionConfig,
        factory: Box<dyn SensorFactory>,
        detector: Box<dyn Detector>,
    ) -> Result<(CameraController, DetectionPipeline, Arc<FrameBuffer>)> {
        let transformer = CoordinateTransformer::load(&config.transform.path)?;

        let buffer = Arc::new(FrameBuffer::new());
        let mut camera = CameraController::new(factory, config.sensor.clone(), Arc::clone(&buffer));
        camera.initialize()?;

        let pipeline = DetectionPipeline::new(config.detection.clone(), detector, transformer);
        Ok((camera, pipeline, buffer))
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn streaming(&self) -> &StreamingState {
        &self.streaming
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Blocks until the running flag drops, then shuts down in order.
    pub fn wait(mut self) -> Result<()> {
        while self.is_running() {
            thread::sleep(Duration::from_millis(100));
        }
        self.shutdown()
    }

    /// Stops the worker, releases the sensor, then removes the PID file and
    /// releases the instance lock.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == DaemonState::Stopped {
            return Ok(());
        }
        self.state = DaemonState::ShuttingDown;
        self.running.store(false, Ordering::SeqCst);
        info!("Daemon shutting down");

        let mut result = Ok(());
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(mut processing) => {
                    processing.shutdown();
                    debug!("Sensor state after shutdown: {:?}", processing.camera().state());
                }
                Err(_) => {
                    result = Err(PerceptionError::CameraError(
                        "processing thread panicked".to_string(),
                    ))
                }
            }
        }
        if let Some(server) = self.command_server.take() {
            if let Err(e) = server.join() {
                error!("{}", e);
            }
        }
        self.pid_file.take();
        self.lock.take();

        self.state = DaemonState::Stopped;
        info!("Daemon stopped");
        result
    }
}

impl Drop for DaemonSupervisor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mock::{MockHandle, MockScript, MockSensorFactory};
    use crate::camera::CameraState;
    use crate::config::SensorConfig;
    use crate::inference::{NullDetector, ScriptedDetector};
    use nalgebra::Matrix4;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::TempDir;
    use tof_common::{Command, CommandRequest, CommandResponse};

    fn identity_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("tof_into_lds.conf");
        let text = "1\n0\n0\n0\n0\n1\n0\n0\n0\n0\n1\n0\n0\n0\n0\n1\n";
        std::fs::write(&path, text).unwrap();
        path
    }

    fn test_config(dir: &TempDir, tag: &str) -> PerceptionConfig {
        let mut config = PerceptionConfig::default();
        config.daemon.lock_file = dir.path().join("tofdaemon.lock");
        config.daemon.frame_wait_ms = 20;
        config.daemon.idle_sleep_ms = 5;
        config.transform.path = identity_file(dir.path());
        config.messaging.publish_endpoint = format!("inproc://{}-data", tag);
        config.messaging.command_endpoint = format!("inproc://{}-command", tag);
        config.messaging.command_poll_ms = 20;
        config
    }

    fn processing_loop(context: &zmq::Context, tag: &str) -> (ProcessingLoop, MockHandle) {
        let factory = MockSensorFactory::new(MockScript {
            generate_frames: false,
            ..Default::default()
        });
        let handle = factory.handle();
        let buffer = Arc::new(FrameBuffer::new());
        let mut camera = CameraController::new(
            Box::new(factory),
            SensorConfig::default(),
            Arc::clone(&buffer),
        );
        camera.initialize().unwrap();

        // One box over the whole image.
        let detector = ScriptedDetector::new(vec![0.0, 1.0, 0.9, 0.0, 0.0, 1.0, 1.0]);
        let pipeline = DetectionPipeline::new(
            Default::default(),
            Box::new(detector),
            CoordinateTransformer::from_matrix(Matrix4::identity()),
        );
        let messaging = crate::config::MessagingConfig {
            publish_endpoint: format!("inproc://{}", tag),
            ..Default::default()
        };

        let processing = ProcessingLoop {
            camera,
            pipeline,
            buffer,
            publisher: ZmqPublisher::new(context, &messaging).unwrap(),
            recorder: None,
            streaming: StreamingState::new(),
            frame_wait: Duration::from_millis(20),
            idle_sleep: Duration::from_millis(1),
        };
        (processing, handle)
    }

    #[test]
    fn test_loop_follows_streaming_flag() {
        let context = zmq::Context::new();
        let (mut processing, mock) = processing_loop(&context, "loop-flag");

        assert_eq!(processing.run_once(), LoopOutcome::Idle);
        assert_eq!(mock.calls().start_capture, 0);

        processing.streaming.set(true);
        assert_eq!(processing.run_once(), LoopOutcome::NoFrame);
        assert!(mock.is_capturing());
        assert_eq!(processing.camera().state(), CameraState::Capturing);

        assert!(mock.emit(&mock.synthetic_frame(2_000_000)));
        match processing.run_once() {
            LoopOutcome::Published { points, status } => {
                assert!(points > 0);
                assert_eq!(status, Status::Ok);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(mock.calls().start_capture, 1);

        processing.streaming.set(false);
        assert_eq!(processing.run_once(), LoopOutcome::Idle);
        assert!(!mock.is_capturing());
        assert_eq!(mock.calls().stop_capture, 1);

        // Stopping again is a no-op.
        assert_eq!(processing.run_once(), LoopOutcome::Idle);
        assert_eq!(mock.calls().stop_capture, 1);
    }

    #[test]
    fn test_idle_loop_discards_buffered_frames() {
        let context = zmq::Context::new();
        let (mut processing, mock) = processing_loop(&context, "loop-stale");

        assert!(mock.emit(&mock.synthetic_frame(0)));
        assert_eq!(processing.buffer.len(), 1);
        assert_eq!(processing.run_once(), LoopOutcome::Idle);
        assert!(processing.buffer.is_empty());
    }

    #[test]
    fn test_held_lock_fails_before_sensor_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "held-lock");
        let _held = InstanceLock::acquire(&config.daemon.lock_file).unwrap();

        let factory = MockSensorFactory::default();
        let mock = factory.handle();
        let context = zmq::Context::new();
        let result = DaemonSupervisor::start(
            &config,
            &context,
            Box::new(factory),
            Box::new(NullDetector),
            Arc::new(AtomicBool::new(true)),
        );

        assert!(matches!(result, Err(PerceptionError::AlreadyRunning(_))));
        assert_eq!(mock.calls().open, 0);
    }

    #[test]
    fn test_missing_transform_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, "no-transform");
        config.transform.path = dir.path().join("missing.conf");
        config.daemon.pid_file = Some(dir.path().join("tof-daemon.pid"));

        let running = Arc::new(AtomicBool::new(true));
        let context = zmq::Context::new();
        let err = DaemonSupervisor::start(
            &config,
            &context,
            Box::new(MockSensorFactory::default()),
            Box::new(NullDetector),
            running.clone(),
        )
        .err()
        .unwrap();

        assert!(err.is_fatal());
        assert!(!running.load(Ordering::SeqCst));
        assert!(!dir.path().join("tof-daemon.pid").exists());
        assert!(!config.daemon.lock_file.exists());
    }

    #[test]
    fn test_stream_commands_drive_the_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, "supervised");
        let pid_path = dir.path().join("tof-daemon.pid");
        config.daemon.pid_file = Some(pid_path.clone());
        let factory = MockSensorFactory::default();
        let mock = factory.handle();
        let context = zmq::Context::new();
        let running = Arc::new(AtomicBool::new(true));

        let mut supervisor = DaemonSupervisor::start(
            &config,
            &context,
            Box::new(factory),
            Box::new(NullDetector),
            running.clone(),
        )
        .unwrap();
        assert_eq!(supervisor.state(), DaemonState::Running);
        assert!(pid_path.exists());
        assert!(matches!(
            InstanceLock::acquire(&config.daemon.lock_file),
            Err(PerceptionError::AlreadyRunning(_))
        ));

        let client = context.socket(zmq::REQ).unwrap();
        client.set_rcvtimeo(2000).unwrap();
        client.connect(&config.messaging.command_endpoint).unwrap();
        let send = |command| {
            let bytes = CommandRequest::new(command).encode().unwrap();
            client.send(bytes, 0).unwrap();
            CommandResponse::decode(&client.recv_bytes(0).unwrap()).unwrap()
        };
        let wait_for = |capturing: bool| {
            let deadline = Instant::now() + Duration::from_secs(2);
            while mock.is_capturing() != capturing && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            mock.is_capturing() == capturing
        };

        assert!(send(Command::StreamStart).is_ack());
        assert!(supervisor.streaming().is_streaming());
        assert!(wait_for(true));

        assert!(send(Command::StreamStop).is_ack());
        assert!(wait_for(false));

        running.store(false, Ordering::SeqCst);
        supervisor.shutdown().unwrap();
        assert_eq!(supervisor.state(), DaemonState::Stopped);
        assert!(!pid_path.exists());
        assert!(!config.daemon.lock_file.exists());
        assert_eq!(mock.calls().start_capture, 1);
    }
}
