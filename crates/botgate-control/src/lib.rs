pub mod api;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logs;
pub mod port_alloc;
pub mod registry;
pub mod runner;
pub mod telemetry;

pub use config::ControlConfig;
pub use error::{ApiError, LogError, PortError, RunnerError, StartError};
pub use lifecycle::{LifecycleController, StartOutcome, StopOutcome};
pub use port_alloc::{LoopbackProbe, PortNegotiator, PortProbe};
pub use registry::{InstanceHealthPoller, InstanceRegistry};
pub use runner::{BotRunner, LocalRunner};
