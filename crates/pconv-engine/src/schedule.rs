//! Partition schedule planning
//!
//! Splits an impulse response of `maxsize` samples into levels of uniform
//! partitions. Level sizes grow by factors of 2 or 4 from `minpart` up to
//! at most `maxpart`. Each non-final level keeps just enough partitions to
//! cover the latency of the next level; the density-weighted cost model
//! decides when it is cheaper to let a level absorb the rest of the response.

use pconv_core::{ConvConfig, ConvError, ConvResult, MAXLEV};

/// One level of the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelPlan {
    /// Thread priority offset relative to the engine's base priority
    pub prio: i32,
    /// Offset of the level's first partition within the impulse response
    pub offs: usize,
    /// Number of partitions
    pub npar: usize,
    /// Partition size
    pub parsize: usize,
}

impl LevelPlan {
    /// Impulse samples covered by this level
    #[inline]
    pub fn span(&self) -> usize {
        self.npar * self.parsize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSchedule {
    pub levels: Vec<LevelPlan>,
}

impl PartitionSchedule {
    /// Plan levels for a validated configuration
    pub fn plan(config: &ConvConfig) -> ConvResult<Self> {
        config.validate()?;

        let density = config.effective_density();
        let cfft = config.costs.fft_cost * (config.ninp + config.nout) as f32;
        let cmac = config.costs.mac_cost * (config.ninp * config.nout) as f32 * density;
        let step: u32 = if cfft < 4.0 * cmac { 1 } else { 2 };

        // With step 2, an odd power-of-two ratio takes one single step first
        // so the last level lands on maxpart.
        let mut s: u32 = if step == 2 && (config.maxpart / config.minpart) & 0xAAAA == 0 {
            2
        } else {
            1
        };
        let mut nmin = if s == 1 { 2 } else { 6 };
        if config.minpart == config.quantum {
            nmin += 1;
        }

        let mut prio = -((config.minpart / config.quantum).trailing_zeros() as i32);
        let mut size = config.minpart;
        let mut offs = 0;
        let mut levels = Vec::new();

        while offs < config.maxsize {
            if levels.len() == MAXLEV {
                return Err(ConvError::BadParam(format!(
                    "impulse of {} samples needs more than {MAXLEV} levels",
                    config.maxsize
                )));
            }
            let mut npar = (config.maxsize - offs).div_ceil(size);
            if size < config.maxpart && npar > nmin {
                let r = 1usize << s;
                let mut d = npar - nmin;
                d -= d.div_ceil(r);
                if cfft < d as f32 * cmac {
                    npar = nmin;
                }
            }
            levels.push(LevelPlan {
                prio,
                offs,
                npar,
                parsize: size,
            });
            offs += size * npar;
            if offs < config.maxsize {
                prio -= s as i32;
                size <<= s;
                s = step;
                nmin = if s == 1 { 2 } else { 6 };
            }
        }

        log::debug!(
            "partition schedule for {} samples: {}",
            config.maxsize,
            levels
                .iter()
                .map(|l| format!("{}x{}@{}", l.npar, l.parsize, l.offs))
                .collect::<Vec<_>>()
                .join(" ")
        );
        Ok(Self { levels })
    }

    /// Largest partition size in use
    pub fn max_parsize(&self) -> usize {
        self.levels.last().map(|l| l.parsize).unwrap_or(0)
    }

    /// Total impulse samples covered
    pub fn coverage(&self) -> usize {
        self.levels.iter().map(LevelPlan::span).sum()
    }
}
