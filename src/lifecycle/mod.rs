//! Process lifecycle
//!
//! This module handles:
//! - Resource sampling with soft (cleanup) and hard (stop) limits
//! - Ctrl-C / SIGTERM handling
//! - The drain, release and flush sequence that ends every run

mod monitor;
mod shutdown;

pub use monitor::{
    Pressure, ResourceLimits, ResourceMonitor, ResourceProbe, ResourceSample, SysinfoProbe,
};
pub use shutdown::{LifecycleController, ShutdownReport, StopReason};
