//! Impulse response editing
//!
//! `ImpulseEditor` is a cloneable handle onto a configured engine's levels.
//! Each edit takes one level lock at a time, so a control thread can load or
//! replace responses while the processing thread keeps running (with
//! `late_contin` set). Edits become audible at the next cycle of each level.

use crate::level::LevelShared;
use pconv_core::{ConvError, ConvResult, EngineState, Sample};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Engine-wide flags visible to editors
pub(crate) struct EngineCell {
    state: AtomicU8,
    generation: AtomicU64,
    late_contin: AtomicBool,
}

impl EngineCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Idle.as_u8()),
            generation: AtomicU64::new(0),
            late_contin: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate editors handed out for the current configuration
    pub(crate) fn retire(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn late_contin(&self) -> bool {
        self.late_contin.load(Ordering::Acquire)
    }

    pub(crate) fn set_late_contin(&self, value: bool) {
        self.late_contin.store(value, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ImpulseEditor {
    cell: Arc<EngineCell>,
    generation: u64,
    levels: Arc<[Arc<LevelShared>]>,
    ninp: usize,
    nout: usize,
    maxsize: usize,
}

impl ImpulseEditor {
    pub(crate) fn new(
        cell: Arc<EngineCell>,
        levels: Arc<[Arc<LevelShared>]>,
        ninp: usize,
        nout: usize,
        maxsize: usize,
    ) -> Self {
        Self {
            generation: cell.generation(),
            cell,
            levels,
            ninp,
            nout,
            maxsize,
        }
    }

    fn check_access(&self) -> ConvResult<()> {
        let state = self.cell.state();
        if self.cell.generation() != self.generation {
            return Err(ConvError::BadState(state));
        }
        if state.is_running() && !self.cell.late_contin() {
            return Err(ConvError::BadState(state));
        }
        Ok(())
    }

    fn check_route(&self, inp: usize, out: usize) -> ConvResult<()> {
        if inp >= self.ninp {
            return Err(ConvError::BadParam(format!(
                "input {inp} out of range ({} inputs)",
                self.ninp
            )));
        }
        if out >= self.nout {
            return Err(ConvError::BadParam(format!(
                "output {out} out of range ({} outputs)",
                self.nout
            )));
        }
        Ok(())
    }

    fn check_data(&self, step: usize, data: &[Sample], ind0: usize, ind1: usize) -> ConvResult<()> {
        if step == 0 {
            return Err(ConvError::BadParam("step must be at least 1".into()));
        }
        if ind0 > ind1 {
            return Err(ConvError::BadParam(format!(
                "empty range {ind0}..{ind1} is reversed"
            )));
        }
        if ind1 > self.maxsize {
            return Err(ConvError::BadParam(format!(
                "impulse response end {ind1} exceeds configured maximum {}",
                self.maxsize
            )));
        }
        let n = ind1 - ind0;
        if n > 0 && data.len() < (n - 1) * step + 1 {
            return Err(ConvError::BadParam(format!(
                "{} values cannot supply {n} samples at step {step}",
                data.len()
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        inp: usize,
        out: usize,
        step: usize,
        data: &[Sample],
        ind0: usize,
        ind1: usize,
        create: bool,
    ) -> ConvResult<()> {
        self.check_access()?;
        self.check_route(inp, out)?;
        self.check_data(step, data, ind0, ind1)?;
        if ind0 == ind1 {
            return Ok(());
        }
        for level in self.levels.iter() {
            level.impdata_write(inp, out, step, data, ind0, ind1, create)?;
        }
        Ok(())
    }

    /// Add impulse samples `ind0..ind1` of path (inp, out), read from
    /// `data[j * step]`, creating the path where needed. Writes accumulate.
    ///
    /// An allocation failure part way through leaves the levels already
    /// written in place; `impdata_clear` discards them.
    pub fn impdata_create(
        &self,
        inp: usize,
        out: usize,
        step: usize,
        data: &[Sample],
        ind0: usize,
        ind1: usize,
    ) -> ConvResult<()> {
        self.write(inp, out, step, data, ind0, ind1, true)
    }

    /// Like `impdata_create`, but only touches partitions that already exist
    pub fn impdata_update(
        &self,
        inp: usize,
        out: usize,
        step: usize,
        data: &[Sample],
        ind0: usize,
        ind1: usize,
    ) -> ConvResult<()> {
        self.write(inp, out, step, data, ind0, ind1, false)
    }

    /// Remove path (inp, out) from every level. Clearing an absent path is a no-op.
    pub fn impdata_clear(&self, inp: usize, out: usize) -> ConvResult<()> {
        self.check_access()?;
        self.check_route(inp, out)?;
        for level in self.levels.iter() {
            level.impdata_clear(inp, out);
        }
        Ok(())
    }

    /// Route (inp2, out2) through the response of (inp1, out1) without copying it
    pub fn impdata_link(&self, inp1: usize, out1: usize, inp2: usize, out2: usize) -> ConvResult<()> {
        self.check_access()?;
        self.check_route(inp1, out1)?;
        self.check_route(inp2, out2)?;
        if (inp1, out1) == (inp2, out2) {
            return Err(ConvError::BadParam(format!(
                "cannot link ({inp1}, {out1}) to itself"
            )));
        }
        for level in self.levels.iter() {
            level.impdata_link(inp1, out1, inp2, out2)?;
        }
        Ok(())
    }

    /// Partition sizes of the levels this editor writes to
    pub fn partition_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.plan().parsize).collect()
    }
}
