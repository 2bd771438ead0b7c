//! Convproc: the multi-channel convolution engine
//!
//! Owns the shared input ring, the per-output accumulators and the list of
//! partition levels. The processing thread calls `process()` once per
//! quantum; everything else is control-plane.
//!
//! Typical use:
//! 1. `configure()` the channel counts and partition range
//! 2. load responses with `impdata_create()`
//! 3. `start_process()`, then per quantum fill `inpdata()`, call
//!    `process()` and read `outdata()`
//! 4. `stop_process()` and `cleanup()`

use crate::editor::{EngineCell, ImpulseEditor};
use crate::level::{Convlevel, LevelStat};
use crate::schedule::PartitionSchedule;
use crate::shared::SharedBuffer;
use pconv_core::{
    ConvConfig, ConvError, ConvResult, CostModel, EngineState, Options, Sample, SchedPolicy,
    WaitPolicy, try_filled,
};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Consecutive late cycles that halt the engine unless `late_contin` is set
pub const MAX_LATE_CYCLES: u32 = 5;

/// How long `start_process` waits for level workers to come up
const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of one `process()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ProcessOutcome {
    Ok,
    /// At least one level had not finished in time. Carries the lifetime late count.
    LateCompletion(u32),
}

impl ProcessOutcome {
    #[inline]
    pub fn is_late(&self) -> bool {
        matches!(self, Self::LateCompletion(_))
    }
}

pub struct Convproc {
    cell: Arc<EngineCell>,
    settings: ConvConfig,
    schedule: PartitionSchedule,
    inpsize: usize,
    inpoffs: usize,
    outoffs: usize,
    skipcnt: usize,
    /// Consecutive late cycles
    latecnt: u32,
    /// Lifetime late cycles
    late_total: u32,
    inpbuff: Vec<Arc<SharedBuffer>>,
    inpstage: Vec<Vec<Sample>>,
    outbuff: Vec<Vec<Sample>>,
    levels: Vec<Convlevel>,
    editor: Option<ImpulseEditor>,
}

impl Convproc {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(EngineCell::new()),
            settings: ConvConfig::default(),
            schedule: PartitionSchedule { levels: Vec::new() },
            inpsize: 0,
            inpoffs: 0,
            outoffs: 0,
            skipcnt: 0,
            latecnt: 0,
            late_total: 0,
            inpbuff: Vec::new(),
            inpstage: Vec::new(),
            outbuff: Vec::new(),
            levels: Vec::new(),
            editor: None,
        }
    }

    /// Build and configure an engine from a complete configuration
    pub fn from_config(config: &ConvConfig) -> ConvResult<Self> {
        let mut proc = Self::new();
        proc.configure_with(config)?;
        Ok(proc)
    }

    // ============ Settings ============

    /// Option flags. `fft_measure` applies at the next `configure`,
    /// `late_contin` immediately.
    pub fn set_options(&mut self, options: Options) {
        self.settings.options = options;
        self.cell.set_late_contin(options.late_contin);
    }

    pub fn options(&self) -> Options {
        self.settings.options
    }

    /// Cost model used by the next `configure`
    pub fn set_costs(&mut self, costs: CostModel) {
        self.settings.costs = costs;
    }

    pub fn set_wait_policy(&mut self, wait: WaitPolicy) {
        self.settings.wait = wait;
    }

    /// Skip multiply-accumulate work for the first `skipcnt` output samples.
    /// Only honoured for a single uniform level (quantum == minpart == maxpart).
    pub fn set_skipcnt(&mut self, skipcnt: usize) {
        if self.settings.quantum == self.settings.minpart
            && self.settings.quantum == self.settings.maxpart
        {
            self.skipcnt = skipcnt;
        }
    }

    // ============ Configuration ============

    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &mut self,
        ninp: usize,
        nout: usize,
        maxsize: usize,
        quantum: usize,
        minpart: usize,
        maxpart: usize,
        density: f32,
    ) -> ConvResult<()> {
        let config = ConvConfig {
            ninp,
            nout,
            maxsize,
            quantum,
            minpart,
            maxpart,
            density,
            ..self.settings.clone()
        };
        self.configure_with(&config)
    }

    /// Plan the partition schedule and allocate every level.
    /// Nothing is kept if any allocation fails.
    pub fn configure_with(&mut self, config: &ConvConfig) -> ConvResult<()> {
        let state = self.state();
        if state != EngineState::Idle || self.is_configured() {
            return Err(ConvError::BadState(state));
        }
        let schedule = PartitionSchedule::plan(config)?;

        let inpsize = 2 * schedule.max_parsize();
        let inpbuff = (0..config.ninp)
            .map(|_| SharedBuffer::new(inpsize).map(Arc::new))
            .collect::<ConvResult<Vec<_>>>()?;
        let inpstage = (0..config.ninp)
            .map(|_| try_filled(config.quantum, 0.0))
            .collect::<ConvResult<Vec<_>>>()?;
        let outbuff = (0..config.nout)
            .map(|_| try_filled(config.minpart, 0.0))
            .collect::<ConvResult<Vec<_>>>()?;
        // The smallest level runs on the processing thread when it matches the quantum
        let inline_first = config.minpart == config.quantum;
        let levels = schedule
            .levels
            .iter()
            .enumerate()
            .map(|(k, &plan)| {
                Convlevel::configure(plan, config.nout, config.options, k > 0 || !inline_first)
            })
            .collect::<ConvResult<Vec<_>>>()?;

        let shared: Arc<[_]> = levels.iter().map(|l| Arc::clone(l.shared())).collect();
        self.editor = Some(ImpulseEditor::new(
            Arc::clone(&self.cell),
            shared,
            config.ninp,
            config.nout,
            config.maxsize,
        ));
        self.settings = config.clone();
        self.cell.set_late_contin(config.options.late_contin);
        self.schedule = schedule;
        self.inpsize = inpsize;
        self.inpbuff = inpbuff;
        self.inpstage = inpstage;
        self.outbuff = outbuff;
        self.levels = levels;
        self.skipcnt = 0;

        log::info!(
            "configured {}x{} convolver: maxsize {}, quantum {}, partitions {}..{}, {} levels, latency {}",
            config.ninp,
            config.nout,
            config.maxsize,
            config.quantum,
            config.minpart,
            self.schedule.max_parsize(),
            self.levels.len(),
            self.latency()
        );
        Ok(())
    }

    /// Handle for loading responses from another thread
    pub fn editor(&self) -> ConvResult<ImpulseEditor> {
        self.editor
            .clone()
            .ok_or(ConvError::BadState(self.state()))
    }

    fn editor_ref(&self) -> ConvResult<&ImpulseEditor> {
        self.editor.as_ref().ok_or(ConvError::BadState(self.state()))
    }

    /// See [`ImpulseEditor::impdata_create`]
    pub fn impdata_create(
        &mut self,
        inp: usize,
        out: usize,
        step: usize,
        data: &[Sample],
        ind0: usize,
        ind1: usize,
    ) -> ConvResult<()> {
        self.editor_ref()?
            .impdata_create(inp, out, step, data, ind0, ind1)
    }

    /// See [`ImpulseEditor::impdata_update`]
    pub fn impdata_update(
        &mut self,
        inp: usize,
        out: usize,
        step: usize,
        data: &[Sample],
        ind0: usize,
        ind1: usize,
    ) -> ConvResult<()> {
        self.editor_ref()?
            .impdata_update(inp, out, step, data, ind0, ind1)
    }

    pub fn impdata_clear(&mut self, inp: usize, out: usize) -> ConvResult<()> {
        self.editor_ref()?.impdata_clear(inp, out)
    }

    pub fn impdata_link(
        &mut self,
        inp1: usize,
        out1: usize,
        inp2: usize,
        out2: usize,
    ) -> ConvResult<()> {
        self.editor_ref()?.impdata_link(inp1, out1, inp2, out2)
    }

    // ============ Lifecycle ============

    /// Reset all rings and start the level workers. Returns once every
    /// worker is waiting; the state is then `Wait` until the first `process()`.
    pub fn start_process(&mut self, abspri: i32, policy: SchedPolicy) -> ConvResult<()> {
        let state = self.state();
        if !self.is_configured() || !matches!(state, EngineState::Idle | EngineState::Stop) {
            return Err(ConvError::BadState(state));
        }
        self.join_levels();
        self.reset()?;

        let spawned = self
            .levels
            .iter_mut()
            .try_for_each(|level| level.start(abspri, policy));
        if let Err(e) = spawned {
            self.join_levels();
            return Err(e);
        }

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while !self.levels.iter().all(Convlevel::is_ready) {
            if Instant::now() > deadline {
                self.join_levels();
                return Err(ConvError::MemAlloc(
                    "level workers did not start in time".into(),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.cell.set_state(EngineState::Wait);
        log::info!(
            "started {} levels ({} threaded), base priority {} {:?}",
            self.levels.len(),
            self.levels.iter().filter(|l| l.is_threaded()).count(),
            abspri,
            policy
        );
        Ok(())
    }

    fn reset(&mut self) -> ConvResult<()> {
        self.inpoffs = 0;
        self.outoffs = 0;
        self.latecnt = 0;
        for buf in &self.inpbuff {
            buf.fill(0.0);
        }
        for stage in &mut self.inpstage {
            stage.fill(0.0);
        }
        for out in &mut self.outbuff {
            out.fill(0.0);
        }
        for level in &mut self.levels {
            level.reset(self.inpsize, self.settings.minpart, &self.inpbuff)?;
        }
        Ok(())
    }

    fn join_levels(&mut self) {
        for level in &self.levels {
            level.stop();
        }
        for level in &mut self.levels {
            level.join();
        }
    }

    /// Stop and join every worker thread
    pub fn stop_process(&mut self) -> ConvResult<()> {
        let state = self.state();
        let halted = state == EngineState::Stop && self.levels.iter().any(Convlevel::has_thread);
        if !state.is_running() && !halted {
            return Err(ConvError::BadState(state));
        }
        if halted {
            log::warn!("engine had halted after {} late cycles", self.late_total);
        }
        self.join_levels();
        self.cell.set_state(EngineState::Stop);
        log::info!("stopped, {} late cycles", self.late_total);
        Ok(())
    }

    /// Stop any workers and release all levels and buffers
    pub fn cleanup(&mut self) {
        self.join_levels();
        self.cell.retire();
        self.editor = None;
        self.levels.clear();
        self.schedule.levels.clear();
        self.inpbuff.clear();
        self.inpstage.clear();
        self.outbuff.clear();
        self.inpsize = 0;
        self.inpoffs = 0;
        self.outoffs = 0;
        self.skipcnt = 0;
        self.latecnt = 0;
        self.late_total = 0;
        if self.cell.state() != EngineState::Idle {
            log::info!("cleaned up");
        }
        self.cell.set_state(EngineState::Idle);
    }

    // ============ Processing ============

    /// Input staging buffer of channel `k`, `quantum` samples, consumed by
    /// the next `process()`
    ///
    /// # Panics
    /// If the engine is not configured or `k >= ninp()`. See [`Self::get_inpdata`].
    #[inline]
    pub fn inpdata(&mut self, k: usize) -> &mut [Sample] {
        &mut self.inpstage[k]
    }

    /// Output of channel `k` produced by the last `process()`, `quantum` samples
    ///
    /// # Panics
    /// If the engine is not configured or `k >= nout()`. See [`Self::get_outdata`].
    #[inline]
    pub fn outdata(&self, k: usize) -> &[Sample] {
        let q = self.settings.quantum;
        &self.outbuff[k][self.outoffs..self.outoffs + q]
    }

    /// Checked [`Self::inpdata`]
    #[inline]
    pub fn get_inpdata(&mut self, k: usize) -> Option<&mut [Sample]> {
        self.inpstage.get_mut(k).map(Vec::as_mut_slice)
    }

    /// Checked [`Self::outdata`]
    #[inline]
    pub fn get_outdata(&self, k: usize) -> Option<&[Sample]> {
        let q = self.settings.quantum;
        self.outbuff
            .get(k)
            .map(|out| &out[self.outoffs..self.outoffs + q])
    }

    /// Consume one quantum of input and produce one quantum of output.
    /// Outside `Wait`/`Proc` the outputs are silent.
    pub fn process(&mut self) -> ProcessOutcome {
        let state = self.state();
        if !state.is_running() {
            for out in &mut self.outbuff {
                out.fill(0.0);
            }
            return ProcessOutcome::Ok;
        }

        let q = self.settings.quantum;
        let minpart = self.settings.minpart;
        for (buf, stage) in self.inpbuff.iter().zip(&self.inpstage) {
            buf.write_from(self.inpoffs, stage);
        }
        self.inpoffs += q;
        if self.inpoffs == self.inpsize {
            self.inpoffs = 0;
        }

        if state == EngineState::Wait {
            self.cell.set_state(EngineState::Proc);
        }

        self.outoffs += q;
        if self.outoffs < minpart {
            return ProcessOutcome::Ok;
        }
        self.outoffs = 0;
        for out in &mut self.outbuff {
            out.fill(0.0);
        }
        let wait = self.settings.wait;
        let mut late = false;
        for level in &mut self.levels {
            late |= level.readout(wait, self.skipcnt, &mut self.outbuff);
        }
        self.skipcnt = self.skipcnt.saturating_sub(minpart);

        // Lateness is judged once per minpart block
        if !late {
            self.latecnt = 0;
            return ProcessOutcome::Ok;
        }
        self.late_total = self.late_total.saturating_add(1);
        self.latecnt += 1;
        if self.latecnt >= MAX_LATE_CYCLES && !self.cell.late_contin() {
            log::warn!("{} consecutive late cycles, halting", self.latecnt);
            self.halt();
        }
        ProcessOutcome::LateCompletion(self.late_total)
    }

    /// Tell workers to exit without waiting for them
    fn halt(&mut self) {
        for level in &self.levels {
            level.stop();
        }
        self.cell.set_state(EngineState::Stop);
    }

    /// Run `nsamp` samples of silent input through the engine, handing each
    /// output quantum (trimmed at the end) to `sink(channel, samples)`.
    pub fn tailonly<F>(&mut self, nsamp: usize, mut sink: F) -> ProcessOutcome
    where
        F: FnMut(usize, &[Sample]),
    {
        let q = self.settings.quantum;
        let mut outcome = ProcessOutcome::Ok;
        let mut produced = 0;
        while produced < nsamp {
            for stage in &mut self.inpstage {
                stage.fill(0.0);
            }
            if let late @ ProcessOutcome::LateCompletion(_) = self.process() {
                outcome = late;
            }
            let take = q.min(nsamp - produced);
            for k in 0..self.outbuff.len() {
                sink(k, &self.outdata(k)[..take]);
            }
            produced += take;
        }
        outcome
    }

    // ============ Introspection ============

    pub fn state(&self) -> EngineState {
        self.cell.state()
    }

    pub fn is_configured(&self) -> bool {
        !self.levels.is_empty()
    }

    /// True once every level has completed a processing cycle
    pub fn check_started(&self) -> bool {
        self.state().is_running() && self.levels.iter().all(|l| l.cycles() > 0)
    }

    /// True once no worker thread is running
    pub fn check_stop(&self) -> bool {
        !self.state().is_running() && self.levels.iter().all(|l| l.stat() == LevelStat::Idle)
    }

    /// Samples between an input sample and its first output, beyond the
    /// quantum alignment itself
    pub fn latency(&self) -> usize {
        if !self.is_configured() || self.settings.minpart == self.settings.quantum {
            0
        } else {
            2 * self.settings.minpart - self.settings.quantum
        }
    }

    pub fn ninp(&self) -> usize {
        self.inpbuff.len()
    }

    pub fn nout(&self) -> usize {
        self.outbuff.len()
    }

    pub fn quantum(&self) -> usize {
        self.settings.quantum
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[Convlevel] {
        &self.levels
    }

    pub fn schedule(&self) -> &PartitionSchedule {
        &self.schedule
    }

    /// Lifetime count of late cycles
    pub fn late_count(&self) -> u32 {
        self.late_total
    }

    pub fn print<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        writeln!(
            w,
            "state = {}, ninp = {}, nout = {}, quantum = {}, minpart = {}, maxpart = {}, latency = {}, late = {}",
            self.state(),
            self.ninp(),
            self.nout(),
            self.settings.quantum,
            self.settings.minpart,
            self.schedule.max_parsize(),
            self.latency(),
            self.late_total
        )?;
        for level in &self.levels {
            level.print(w)?;
        }
        Ok(())
    }
}

impl Default for Convproc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Convproc {
    fn drop(&mut self) {
        self.cleanup();
    }
}
