pub mod config;
pub mod context;
pub mod controller;
pub mod launcher;
pub mod monitor;
pub mod state;

pub use config::{CliArgs, ControllerConfig, LaunchMode, MasterConfig};
pub use context::EngineContext;
pub use launcher::{InlineLauncher, ProcessLauncher, WorkerLauncher};
pub use state::ControllerStats;
