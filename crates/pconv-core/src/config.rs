//! Engine configuration
//!
//! Everything `Convproc::configure` and `start_process` consume, as one
//! serialisable struct so hosts can keep engine setups in JSON files.

use crate::{
    ConvError, ConvResult, MAXDIVIS, MAXINP, MAXOUT, MAXPART, MAXQUANT, MINPART, MINQUANT,
};
use serde::{Deserialize, Serialize};

// ============ Options ============

/// Engine option flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Prime FFT plans and scratch with trial transforms at configure time
    pub fft_measure: bool,
    /// Keep processing when levels complete late; allows impulse edits while running
    pub late_contin: bool,
}

impl Options {
    pub const FFT_MEASURE: u32 = 1;
    pub const LATE_CONTIN: u32 = 4;

    /// Build from classic bit flags, unknown bits ignored
    pub fn from_bits(bits: u32) -> Self {
        Self {
            fft_measure: bits & Self::FFT_MEASURE != 0,
            late_contin: bits & Self::LATE_CONTIN != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.fft_measure {
            bits |= Self::FFT_MEASURE;
        }
        if self.late_contin {
            bits |= Self::LATE_CONTIN;
        }
        bits
    }
}

/// Relative cost of one FFT versus one multiply-accumulate pass
///
/// Drives how many partitions each level keeps before handing the rest of
/// the response to the next, larger level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub fft_cost: f32,
    pub mac_cost: f32,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fft_cost: 5.0,
            mac_cost: 1.0,
        }
    }
}

/// How `process()` waits for a background level to signal completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Never block; a missing completion is counted as late
    #[default]
    Poll,
    /// Block until the level is done (offline rendering)
    Block,
    /// Block for at most this many microseconds per pending cycle
    Deadline { micros: u64 },
}

/// Scheduling class for level worker threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    /// Normal time-sharing; priority ignored
    #[default]
    Other,
    Fifo,
    RoundRobin,
}

// ============ ConvConfig ============

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvConfig {
    /// Number of input channels
    pub ninp: usize,
    /// Number of output channels
    pub nout: usize,
    /// Longest impulse response, in samples
    pub maxsize: usize,
    /// Samples per `process()` call
    pub quantum: usize,
    /// Smallest partition size
    pub minpart: usize,
    /// Largest partition size
    pub maxpart: usize,
    /// Expected fraction of populated input/output pairs; <= 0 selects 1/min(ninp, nout)
    pub density: f32,
    pub options: Options,
    pub costs: CostModel,
    pub wait: WaitPolicy,
    /// Base priority passed to `start_process`
    pub priority: i32,
    pub policy: SchedPolicy,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            ninp: 1,
            nout: 1,
            maxsize: 65536,
            quantum: 64,
            minpart: 64,
            maxpart: 8192,
            density: 0.0,
            options: Options::default(),
            costs: CostModel::default(),
            wait: WaitPolicy::default(),
            priority: 0,
            policy: SchedPolicy::default(),
        }
    }
}

fn check_pow2(name: &str, value: usize, min: usize, max: usize) -> ConvResult<()> {
    if !value.is_power_of_two() {
        return Err(ConvError::BadParam(format!(
            "{name} = {value} is not a power of two"
        )));
    }
    if value < min || value > max {
        return Err(ConvError::BadParam(format!(
            "{name} = {value} outside [{min}, {max}]"
        )));
    }
    Ok(())
}

impl ConvConfig {
    /// Check every parameter rule of `configure`
    pub fn validate(&self) -> ConvResult<()> {
        if self.ninp == 0 || self.ninp > MAXINP {
            return Err(ConvError::BadParam(format!(
                "ninp = {} outside [1, {MAXINP}]",
                self.ninp
            )));
        }
        if self.nout == 0 || self.nout > MAXOUT {
            return Err(ConvError::BadParam(format!(
                "nout = {} outside [1, {MAXOUT}]",
                self.nout
            )));
        }
        if self.maxsize == 0 {
            return Err(ConvError::BadParam("maxsize must be at least 1".into()));
        }
        check_pow2("quantum", self.quantum, MINQUANT, MAXQUANT)?;
        check_pow2(
            "minpart",
            self.minpart,
            MINPART.max(self.quantum),
            MAXPART.min(MAXDIVIS * self.quantum),
        )?;
        check_pow2("maxpart", self.maxpart, self.minpart, MAXPART)?;
        if !self.density.is_finite() {
            return Err(ConvError::BadParam(format!(
                "density = {} is not finite",
                self.density
            )));
        }
        if !(self.costs.fft_cost > 0.0 && self.costs.mac_cost > 0.0) {
            return Err(ConvError::BadParam(format!(
                "cost model {:?} must be positive",
                self.costs
            )));
        }
        Ok(())
    }

    /// Density actually used by the partition planner
    pub fn effective_density(&self) -> f32 {
        if self.density <= 0.0 {
            1.0 / self.ninp.min(self.nout).max(1) as f32
        } else if self.density > 1.0 {
            log::debug!("density {} clamped to 1", self.density);
            1.0
        } else {
            self.density
        }
    }

    pub fn from_json(json: &str) -> ConvResult<Self> {
        serde_json::from_str(json).map_err(|e| ConvError::BadParam(format!("config: {e}")))
    }

    pub fn to_json(&self) -> ConvResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConvError::BadParam(format!("config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConvConfig::default().validate().is_ok());
    }

    #[test]
    fn test_option_bits() {
        let opts = Options::from_bits(Options::LATE_CONTIN | 2);
        assert!(opts.late_contin);
        assert!(!opts.fft_measure);
        assert_eq!(opts.bits(), Options::LATE_CONTIN);
        assert_eq!(Options::from_bits(5).bits(), 5);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let base = ConvConfig::default();
        let cases = [
            ConvConfig { ninp: 0, ..base.clone() },
            ConvConfig { nout: MAXOUT + 1, ..base.clone() },
            ConvConfig { maxsize: 0, ..base.clone() },
            ConvConfig { quantum: 48, ..base.clone() },
            ConvConfig { quantum: 8, minpart: 64, ..base.clone() },
            // minpart smaller than quantum
            ConvConfig { quantum: 128, minpart: 64, ..base.clone() },
            // minpart too far above quantum
            ConvConfig { quantum: 16, minpart: 512, ..base.clone() },
            ConvConfig { minpart: 32, quantum: 32, ..base.clone() },
            ConvConfig { maxpart: 32, ..base.clone() },
            ConvConfig { maxpart: 16384, ..base.clone() },
            ConvConfig { density: f32::NAN, ..base.clone() },
        ];
        for cfg in cases {
            match cfg.validate() {
                Err(ConvError::BadParam(_)) => {}
                other => panic!("{cfg:?} gave {other:?}"),
            }
        }
    }

    #[test]
    fn test_accepts_edge_values() {
        let cfg = ConvConfig {
            ninp: MAXINP,
            nout: MAXOUT,
            quantum: 16,
            minpart: 256,
            maxpart: 256,
            ..ConvConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_effective_density() {
        let cfg = ConvConfig {
            ninp: 4,
            nout: 2,
            density: 0.0,
            ..ConvConfig::default()
        };
        assert_relative_eq!(cfg.effective_density(), 0.5);
        assert_relative_eq!(ConvConfig { density: 3.0, ..cfg.clone() }.effective_density(), 1.0);
        assert_relative_eq!(ConvConfig { density: 0.25, ..cfg }.effective_density(), 0.25);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = ConvConfig::from_json(
            r#"{ "ninp": 2, "nout": 2, "maxsize": 4800, "wait": { "deadline": { "micros": 500 } },
                 "options": { "late_contin": true } }"#,
        )
        .unwrap();
        assert_eq!(cfg.ninp, 2);
        assert_eq!(cfg.quantum, 64);
        assert_eq!(cfg.wait, WaitPolicy::Deadline { micros: 500 });
        assert!(cfg.options.late_contin);
        assert_eq!(cfg.costs, CostModel::default());

        let back = ConvConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);

        assert!(matches!(
            ConvConfig::from_json("{ \"ninp\": \"two\" }"),
            Err(ConvError::BadParam(_))
        ));
    }
}
