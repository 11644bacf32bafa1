pub mod camera;
pub mod handoff;
pub mod status;
pub mod supervisor;

pub use camera::{CameraPipeline, Command};
pub use handoff::{handoff, HandoffReceiver, HandoffSender, HandoffStats};
pub use status::{CameraStatus, ConnectionState, StatusBoard, StatusEntry};
pub use supervisor::{ReconnectSupervisor, SupervisorPolicy, Tick};
