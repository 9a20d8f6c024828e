//! Process-wide trading halt switch
//!
//! A shared flag consulted by the order manager before every submission and
//! by worker loops to decide when to drain and exit. Flipped by the Ctrl+C
//! handler in the binary, by the risk manager's emergency latch, and by
//! resource-monitor policies.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info};

/// Halt switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KillSwitchState {
    /// Normal operation
    Running = 0,
    /// Trading paused; loops keep running but no new orders
    Paused = 1,
    /// Graceful shutdown in progress
    ShuttingDown = 2,
    /// Emergency stop, no cleanup beyond cancels
    EmergencyStop = 3,
}

impl From<u8> for KillSwitchState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Paused,
            2 => Self::ShuttingDown,
            3 => Self::EmergencyStop,
            _ => Self::Running,
        }
    }
}

/// Thread-safe halt coordination; clones observe the same switch.
#[derive(Clone)]
pub struct KillSwitch {
    state: Arc<AtomicU8>,
    reason: Arc<parking_lot::Mutex<Option<String>>>,
    triggered_at: Arc<parking_lot::Mutex<Option<SystemTime>>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(KillSwitchState::Running as u8)),
            reason: Arc::new(parking_lot::Mutex::new(None)),
            triggered_at: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// True once shutdown or emergency stop has been requested. Worker
    /// loops poll this and drain when it flips.
    #[inline]
    pub fn should_stop(&self) -> bool {
        matches!(
            self.state(),
            KillSwitchState::ShuttingDown | KillSwitchState::EmergencyStop
        )
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.state() == KillSwitchState::Paused
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == KillSwitchState::Running
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self, reason: &str) {
        info!(reason, "kill switch: shutdown requested");
        self.state
            .store(KillSwitchState::ShuttingDown as u8, Ordering::Release);
        *self.reason.lock() = Some(reason.to_string());
        *self.triggered_at.lock() = Some(SystemTime::now());
    }

    /// Request immediate emergency stop.
    pub fn emergency_stop(&self, reason: &str) {
        error!(reason, "kill switch: EMERGENCY STOP");
        self.state
            .store(KillSwitchState::EmergencyStop as u8, Ordering::Release);
        *self.reason.lock() = Some(format!("EMERGENCY: {}", reason));
        *self.triggered_at.lock() = Some(SystemTime::now());
    }

    /// Pause trading; resumable.
    pub fn pause(&self) {
        if self.is_running() {
            info!("kill switch: trading paused");
            self.state
                .store(KillSwitchState::Paused as u8, Ordering::Release);
        }
    }

    /// Resume from paused.
    pub fn resume(&self) {
        if self.is_paused() {
            info!("kill switch: trading resumed");
            self.state
                .store(KillSwitchState::Running as u8, Ordering::Release);
        }
    }

    pub fn state(&self) -> KillSwitchState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_running() {
        let ks = KillSwitch::new();
        assert!(ks.is_running());
        assert!(!ks.should_stop());
        assert!(ks.reason().is_none());
    }

    #[test]
    fn test_shutdown_sets_reason() {
        let ks = KillSwitch::new();
        ks.shutdown("operator request");
        assert!(ks.should_stop());
        assert_eq!(ks.reason().as_deref(), Some("operator request"));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let ks = KillSwitch::new();
        ks.pause();
        assert!(ks.is_paused());
        assert!(!ks.should_stop());
        ks.resume();
        assert!(ks.is_running());
    }

    #[test]
    fn test_resume_does_not_clear_shutdown() {
        let ks = KillSwitch::new();
        ks.shutdown("done");
        ks.resume();
        assert!(ks.should_stop());
    }

    #[test]
    fn test_clone_shares_state() {
        let ks1 = KillSwitch::new();
        let ks2 = ks1.clone();
        ks1.emergency_stop("breach");
        assert_eq!(ks2.state(), KillSwitchState::EmergencyStop);
        assert!(ks2.reason().unwrap().starts_with("EMERGENCY"));
    }
}
