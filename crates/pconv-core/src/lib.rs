//! pconv-core: Shared types for the pconv partitioned convolution engine
//!
//! Sample type, channel and partition limits, engine state, the error
//! taxonomy and the serialisable engine configuration.

mod config;
mod error;

pub use config::*;
pub use error::*;

use serde::{Deserialize, Serialize};

/// Type alias for audio samples (f64 throughout the engine)
pub type Sample = f64;

// ============ Limits ============

/// Maximum number of input channels
pub const MAXINP: usize = 64;
/// Maximum number of output channels
pub const MAXOUT: usize = 64;
/// Maximum number of partition levels
pub const MAXLEV: usize = 8;
/// Smallest allowed partition size
pub const MINPART: usize = 64;
/// Largest allowed partition size
pub const MAXPART: usize = 8192;
/// Maximum ratio between smallest partition and processing quantum
pub const MAXDIVIS: usize = 16;
/// Smallest allowed processing quantum
pub const MINQUANT: usize = 16;
/// Largest allowed processing quantum
pub const MAXQUANT: usize = 8192;

/// Engine lifecycle state
///
/// `Idle` covers both "unconfigured" and "configured, never started".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EngineState {
    /// No worker threads
    Idle = 0,
    /// Worker threads stopped (explicitly or after repeated late cycles)
    Stop = 1,
    /// Worker threads running, no processing cycle yet
    Wait = 2,
    /// Processing
    Proc = 3,
}

impl EngineState {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Stop,
            2 => Self::Wait,
            3 => Self::Proc,
            _ => Self::Idle,
        }
    }

    /// True while worker threads may be running
    #[inline]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Wait | Self::Proc)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Stop => "STOP",
            Self::Wait => "WAIT",
            Self::Proc => "PROC",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_through_u8() {
        for state in [
            EngineState::Idle,
            EngineState::Stop,
            EngineState::Wait,
            EngineState::Proc,
        ] {
            assert_eq!(EngineState::from_u8(state.as_u8()), state);
        }
        assert_eq!(EngineState::from_u8(200), EngineState::Idle);
    }

    #[test]
    fn test_running_states() {
        assert!(!EngineState::Idle.is_running());
        assert!(!EngineState::Stop.is_running());
        assert!(EngineState::Wait.is_running());
        assert!(EngineState::Proc.is_running());
        assert_eq!(EngineState::Proc.to_string(), "PROC");
    }

    #[test]
    fn test_limits_are_consistent() {
        assert!(MINPART.is_power_of_two() && MAXPART.is_power_of_two());
        assert!(MINQUANT <= MINPART);
        assert!(MAXPART / MINPART < 1 << MAXLEV);
    }
}
