//! Process-level plumbing: single-instance lock, detaching from the
//! terminal, optional frame recording and the supervisor tying the
//! sensor, pipeline and IPC threads together.

pub mod detach;
pub mod instance_lock;
pub mod recorder;
pub mod supervisor;

pub use detach::{detach_from_terminal, PidFile};
pub use instance_lock::InstanceLock;
pub use recorder::FrameRecorder;
pub use supervisor::{DaemonState, DaemonSupervisor, LoopOutcome, ProcessingLoop};
