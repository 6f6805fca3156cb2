//! Resource monitoring
//!
//! Samples the process's resident memory and thread count on an interval.
//! Crossing the soft memory limit triggers a cleanup pass (every session is
//! recycled before its next item and the checkpoint is flushed). Crossing a
//! hard limit stops the run with a saved checkpoint.

use super::{LifecycleController, StopReason};
use crate::config::ResourceConfig;
use crate::session::RecycleSignal;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::time::MissedTickBehavior;

/// One resource reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSample {
    pub rss_mb: u64,
    pub threads: Option<u64>,
}

/// Source of resource readings
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// Reads this process's usage through `sysinfo`
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Resource monitoring unavailable: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        let pid = self.pid?;
        self.system.refresh_process(pid);
        let process = self.system.process(pid)?;
        Some(ResourceSample {
            rss_mb: process.memory() / (1024 * 1024),
            threads: thread_count(),
        })
    }
}

#[cfg(target_os = "linux")]
fn thread_count() -> Option<u64> {
    std::fs::read_dir("/proc/self/task")
        .ok()
        .map(|entries| entries.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn thread_count() -> Option<u64> {
    None
}

/// How a sample compares to the configured limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    Soft,
    Hard(String),
}

/// Configured limits; `None` disables a check
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    pub memory_limit_mb: Option<u64>,
    pub memory_soft_limit_mb: Option<u64>,
    pub thread_limit: Option<u64>,
}

impl ResourceLimits {
    pub fn from_config(config: &ResourceConfig) -> Self {
        Self {
            memory_limit_mb: config.memory_limit_mb,
            memory_soft_limit_mb: config.memory_soft_limit_mb,
            thread_limit: config.thread_limit,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memory_limit_mb.is_none()
            && self.memory_soft_limit_mb.is_none()
            && self.thread_limit.is_none()
    }

    pub fn evaluate(&self, sample: &ResourceSample) -> Pressure {
        if let Some(limit) = self.memory_limit_mb {
            if sample.rss_mb > limit {
                return Pressure::Hard(format!(
                    "memory {} MB exceeds limit of {} MB",
                    sample.rss_mb, limit
                ));
            }
        }

        if let (Some(limit), Some(threads)) = (self.thread_limit, sample.threads) {
            if threads > limit {
                return Pressure::Hard(format!(
                    "{} threads exceed limit of {}",
                    threads, limit
                ));
            }
        }

        match self.memory_soft_limit_mb {
            Some(limit) if sample.rss_mb > limit => Pressure::Soft,
            _ => Pressure::Normal,
        }
    }
}

/// Periodic sampler driving cleanup and hard stops
pub struct ResourceMonitor {
    probe: Box<dyn ResourceProbe>,
    limits: ResourceLimits,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>, limits: ResourceLimits, interval: Duration) -> Self {
        Self {
            probe,
            limits,
            interval,
        }
    }

    /// Samples until the run stops or a hard limit is hit
    ///
    /// The first sample is taken immediately.
    pub async fn run(mut self, lifecycle: Arc<LifecycleController>, recycle: RecycleSignal) {
        let shutdown = lifecycle.shutdown_token();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut soft_active = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let Some(sample) = self.probe.sample() else {
                continue;
            };
            tracing::trace!(
                "Resource sample: {} MB, {:?} threads",
                sample.rss_mb,
                sample.threads
            );

            match self.limits.evaluate(&sample) {
                Pressure::Hard(reason) => {
                    tracing::error!("Resource limit exceeded: {}", reason);
                    lifecycle.request_stop(StopReason::ResourceExhausted(reason));
                    return;
                }
                Pressure::Soft => {
                    if !soft_active {
                        tracing::warn!(
                            "Memory at {} MB is above the soft limit, recycling sessions",
                            sample.rss_mb
                        );
                        recycle.request();
                        lifecycle.flush();
                        soft_active = true;
                    }
                }
                Pressure::Normal => soft_active = false,
            }
        }
    }
}
