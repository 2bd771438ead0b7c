//! Convlevel: one level of uniform partitions
//!
//! A level convolves every routed input with its share of the impulse
//! responses, `npar` partitions of `parsize` samples starting at `offs`.
//! It wakes once per `parsize` samples of input, either on its own worker
//! thread (trigger/done semaphores) or inline on the processing thread
//! when its partition size equals the processing quantum.
//!
//! Overlap-add runs through a triple buffer per output channel: while the
//! processing thread reads slot `opind`, the level completes slot
//! `opind + 1` (second half of the previous block plus first half of the
//! current one) and starts slot `opind + 2`.

use crate::fft::{Bin, FftPlan, complex_mac};
use crate::node::NodeGraph;
use crate::priority;
use crate::schedule::LevelPlan;
use crate::semaphore::Semaphore;
use crate::shared::{OutRing, SharedBuffer};
use parking_lot::Mutex;
use pconv_core::{ConvResult, Options, Sample, SchedPolicy, WaitPolicy, try_filled};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll interval while blocking on a worker that might have exited
const BLOCK_POLL: Duration = Duration::from_millis(100);

/// Worker thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LevelStat {
    /// No worker thread, or the worker has exited
    Idle = 0,
    /// Worker waiting for or running cycles
    Proc = 1,
    /// Worker asked to exit
    Term = 2,
}

impl LevelStat {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Proc,
            2 => Self::Term,
            _ => Self::Idle,
        }
    }
}

// ============ Cursor ============

/// Position of a level in its input ring, input spectrum ring and
/// overlap buffers. Owned by whichever thread runs the level's cycles.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    ptind: usize,
    opind: usize,
    inpoffs: usize,
}

impl Cursor {
    #[inline]
    fn advance(&mut self, npar: usize, parsize: usize, inpsize: usize) {
        self.ptind = (self.ptind + 1) % npar;
        self.opind = (self.opind + 1) % 3;
        self.inpoffs += parsize;
        if self.inpoffs >= inpsize {
            self.inpoffs -= inpsize;
        }
    }
}

// ============ LevelCore ============

/// Everything a processing cycle mutates, guarded by the level lock
struct LevelCore {
    fft: FftPlan,
    graph: NodeGraph,
    inpbuff: Vec<Arc<SharedBuffer>>,
    inpsize: usize,
}

impl LevelCore {
    /// One cycle: transform the newest input block of every routed input,
    /// multiply-accumulate against all partitions and overlap-add into the
    /// output rings.
    fn process(&mut self, cursor: &mut Cursor, outrings: &[OutRing], npar: usize, skip: bool) {
        let LevelCore {
            fft,
            graph,
            inpbuff,
            inpsize,
        } = self;
        let p = fft.parsize();
        let i1 = cursor.inpoffs;
        let n1 = p.min(*inpsize - i1);
        let ptind = cursor.ptind;
        let opi1 = (cursor.opind + 1) % 3;
        let opi2 = (cursor.opind + 2) % 3;

        for (_, x) in graph.inputs.iter_mut() {
            let inpd = &inpbuff[x.inp];
            inpd.read_into(i1, &mut fft.time_data[..n1]);
            if n1 < p {
                inpd.read_into(0, &mut fft.time_data[n1..p]);
            }
            fft.time_data[p..].fill(0.0);
            fft.forward_time(&mut x.ffta[ptind]);
        }

        for (_, y) in graph.outputs.iter() {
            let ring = &outrings[y.out];
            if skip {
                ring.buff[opi2].fill(0.0);
                continue;
            }
            fft.freq_data.fill(Bin::default());
            for &m in &y.macs {
                let x = &graph.inputs[graph.macs[m].inpn];
                let mut i = ptind;
                for fftb in graph.spectra(m) {
                    if let Some(fftb) = fftb {
                        complex_mac(&mut fft.freq_data, &x.ffta[i], fftb);
                    }
                    i = if i == 0 { npar - 1 } else { i - 1 };
                }
            }
            fft.inverse();
            ring.buff[opi1].accumulate_from(0, &fft.time_data[..p]);
            ring.buff[opi2].write_from(0, &fft.time_data[p..]);
        }

        cursor.advance(npar, p, *inpsize);
    }
}

// ============ LevelShared ============

/// State shared between a level's owner, its worker and impulse editors
pub(crate) struct LevelShared {
    plan: LevelPlan,
    stat: AtomicU8,
    cycles: AtomicU64,
    core: Mutex<LevelCore>,
    outrings: Box<[OutRing]>,
    trig: Semaphore,
    done: Semaphore,
}

impl LevelShared {
    /// Hold the level lock the way a long impulse edit would
    #[cfg(test)]
    pub(crate) fn hold(&self) -> impl Sized + '_ {
        self.core.lock()
    }

    #[inline]
    fn stat(&self) -> LevelStat {
        LevelStat::from_u8(self.stat.load(Ordering::Acquire))
    }

    #[inline]
    fn set_stat(&self, stat: LevelStat) {
        self.stat.store(stat as u8, Ordering::Release);
    }

    pub(crate) fn plan(&self) -> &LevelPlan {
        &self.plan
    }

    /// Transform the part of `data` that falls inside this level and add it
    /// to the partition spectra of (inp, out). `data[j * step]` is impulse
    /// sample `ind0 + j`. With `create`, missing nodes and spectra are
    /// allocated; without it only existing spectra are updated.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn impdata_write(
        &self,
        inp: usize,
        out: usize,
        step: usize,
        data: &[Sample],
        ind0: usize,
        ind1: usize,
        create: bool,
    ) -> ConvResult<()> {
        let parsize = self.plan.parsize as isize;
        let n = ind1 as isize - ind0 as isize;
        let mut i0 = self.plan.offs as isize - ind0 as isize;
        if i0 >= n || i0 + self.plan.span() as isize <= 0 {
            return Ok(());
        }

        let mut core = self.core.lock();
        let LevelCore { fft, graph, .. } = &mut *core;
        let m = if create {
            let m = graph.create_macnode(inp, out)?;
            self.outrings[out].set_active(true);
            m
        } else {
            match graph.find_macnode(inp, out) {
                Some(m) => m,
                None => return Ok(()),
            }
        };

        let spectrum_len = fft.spectrum_len();
        let norm = 0.5 / parsize as Sample;
        let mac = &mut graph.macs[m];
        if mac.link.is_some() {
            return Ok(());
        }
        for slot in mac.fftb.iter_mut() {
            let i1 = i0 + parsize;
            if i0 < n && i1 > 0 {
                if slot.is_none() && create {
                    *slot = Some(try_filled(spectrum_len, Bin::default())?);
                }
                if let Some(fftb) = slot.as_mut() {
                    fft.prep_data.fill(0.0);
                    for j in i0.max(0)..i1.min(n) {
                        fft.prep_data[(j - i0) as usize] = norm * data[j as usize * step];
                    }
                    fft.forward_prep();
                    for (b, f) in fftb.iter_mut().zip(&fft.freq_data) {
                        *b += *f;
                    }
                }
            }
            i0 = i1;
        }
        Ok(())
    }

    /// Remove the (inp, out) path from this level
    pub(crate) fn impdata_clear(&self, inp: usize, out: usize) {
        let mut core = self.core.lock();
        if core.graph.remove_macnode(inp, out) && core.graph.find_outnode(out).is_none() {
            let ring = &self.outrings[out];
            ring.set_active(false);
            ring.clear();
        }
    }

    /// Route (inp2, out2) through the spectra of (inp1, out1). No-op when
    /// the source path has nothing in this level.
    pub(crate) fn impdata_link(
        &self,
        inp1: usize,
        out1: usize,
        inp2: usize,
        out2: usize,
    ) -> ConvResult<()> {
        let mut core = self.core.lock();
        let graph = &mut core.graph;
        let Some(src) = graph.find_macnode(inp1, out1) else {
            return Ok(());
        };
        let root = graph.macs[src].link.unwrap_or(src);
        let dst = graph.create_macnode(inp2, out2)?;
        if dst == root {
            return Ok(());
        }
        for (_, other) in graph.macs.iter_mut() {
            if other.link == Some(dst) {
                other.link = Some(root);
            }
        }
        let mac = &mut graph.macs[dst];
        mac.fftb.iter_mut().for_each(|b| *b = None);
        mac.link = Some(root);
        self.outrings[out2].set_active(true);
        Ok(())
    }
}

// ============ Worker ============

fn run_worker(shared: Arc<LevelShared>, mut cursor: Cursor, prio: i32, policy: SchedPolicy) {
    if let Err(e) = priority::apply_to_current_thread(prio, policy) {
        log::warn!(
            "level {}: could not apply {:?} priority {}: {}",
            shared.plan.parsize,
            policy,
            prio,
            e
        );
    }
    // Stop may already have been requested
    let _ = shared.stat.compare_exchange(
        LevelStat::Idle as u8,
        LevelStat::Proc as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    loop {
        shared.trig.wait();
        if shared.stat() == LevelStat::Term {
            break;
        }
        shared
            .core
            .lock()
            .process(&mut cursor, &shared.outrings, shared.plan.npar, false);
        shared.cycles.fetch_add(1, Ordering::Release);
        shared.done.post();
    }

    shared.set_stat(LevelStat::Idle);
    shared.done.post();
}

// ============ Convlevel ============

pub struct Convlevel {
    shared: Arc<LevelShared>,
    inpsize: usize,
    outsize: usize,
    outoffs: usize,
    opind: usize,
    /// Cycle position when the level runs inline
    cursor: Cursor,
    /// Triggered cycles not yet confirmed done
    wait: usize,
    late: u64,
    threaded: bool,
    thread: Option<JoinHandle<()>>,
}

impl Convlevel {
    /// Allocate FFT resources and output rings for one schedule level.
    /// An unthreaded level runs its cycles inline from `readout`.
    pub fn configure(
        plan: LevelPlan,
        nout: usize,
        options: Options,
        threaded: bool,
    ) -> ConvResult<Self> {
        let fft = FftPlan::new(plan.parsize, options.fft_measure)?;
        let graph = NodeGraph::new(plan.npar, fft.spectrum_len());
        let outrings = (0..nout)
            .map(|_| OutRing::new(plan.parsize))
            .collect::<ConvResult<Vec<_>>>()?
            .into_boxed_slice();

        log::debug!(
            "level parsize {} npar {} offs {} prio {}",
            plan.parsize,
            plan.npar,
            plan.offs,
            plan.prio
        );

        Ok(Self {
            shared: Arc::new(LevelShared {
                plan,
                stat: AtomicU8::new(LevelStat::Idle as u8),
                cycles: AtomicU64::new(0),
                core: Mutex::new(LevelCore {
                    fft,
                    graph,
                    inpbuff: Vec::new(),
                    inpsize: 0,
                }),
                outrings,
                trig: Semaphore::default(),
                done: Semaphore::default(),
            }),
            inpsize: 0,
            outsize: 0,
            outoffs: 0,
            opind: 0,
            cursor: Cursor::default(),
            wait: 0,
            late: 0,
            threaded,
            thread: None,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<LevelShared> {
        &self.shared
    }

    pub fn plan(&self) -> &LevelPlan {
        &self.shared.plan
    }

    pub fn stat(&self) -> LevelStat {
        self.shared.stat()
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    /// Completed processing cycles since the last reset
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Readouts at which this level had fallen behind
    pub fn late_count(&self) -> u64 {
        self.late
    }

    /// True once the worker (if any) is waiting for cycles
    pub fn is_ready(&self) -> bool {
        !self.threaded || self.stat() == LevelStat::Proc
    }

    pub fn has_thread(&self) -> bool {
        self.thread.is_some()
    }

    /// Bind the shared input ring and restore the initial phase.
    ///
    /// Levels larger than the output block start half a partition in, which
    /// staggers the wakeups of different levels. Impulse data and FFT plans
    /// are kept. Must not be called while the worker runs.
    pub fn reset(
        &mut self,
        inpsize: usize,
        outsize: usize,
        inpbuff: &[Arc<SharedBuffer>],
    ) -> ConvResult<()> {
        let p = self.shared.plan.parsize;
        let (outoffs, inpoffs) = if p == outsize {
            (0, 0)
        } else {
            (p / 2, inpsize - p / 2)
        };
        self.inpsize = inpsize;
        self.outsize = outsize;
        self.outoffs = outoffs;
        self.opind = 0;
        self.wait = 0;
        // A worker writes one slot ahead of the reader's post-trigger index
        self.cursor = Cursor {
            ptind: 0,
            opind: usize::from(self.threaded),
            inpoffs,
        };

        {
            let mut core = self.shared.core.lock();
            core.inpbuff = inpbuff.to_vec();
            core.inpsize = inpsize;
            core.graph.reset_inputs();
        }
        for ring in self.shared.outrings.iter() {
            ring.clear();
        }
        self.shared.trig.init(0)?;
        self.shared.done.init(0)?;
        self.shared.cycles.store(0, Ordering::Release);
        self.shared.set_stat(LevelStat::Idle);
        Ok(())
    }

    /// Spawn the worker thread; inline levels have none
    pub fn start(&mut self, abspri: i32, policy: SchedPolicy) -> ConvResult<()> {
        if !self.threaded || self.thread.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let cursor = self.cursor;
        let prio = abspri + self.shared.plan.prio;
        let handle = thread::Builder::new()
            .name(format!("pconv-level-{}", self.shared.plan.parsize))
            .spawn(move || run_worker(shared, cursor, prio, policy))
            .map_err(|e| pconv_core::ConvError::MemAlloc(format!("level worker thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Ask the worker to exit. Never blocks.
    pub fn stop(&self) {
        if self.thread.is_some() {
            self.shared.set_stat(LevelStat::Term);
            self.shared.trig.post();
        }
    }

    /// Wait for the worker to exit
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::warn!("level {} worker panicked", self.shared.plan.parsize);
            }
            self.shared.set_stat(LevelStat::Idle);
        }
        self.wait = 0;
    }

    /// Run one cycle on the calling thread. Skips the cycle (returns false)
    /// when an impulse edit holds the level lock.
    pub fn process(&mut self, skip: bool) -> bool {
        let shared = &*self.shared;
        let processed = match shared.core.try_lock() {
            Some(mut core) => {
                core.process(&mut self.cursor, &shared.outrings, shared.plan.npar, skip);
                true
            }
            None => {
                self.cursor
                    .advance(shared.plan.npar, shared.plan.parsize, self.inpsize);
                false
            }
        };
        if processed {
            shared.cycles.fetch_add(1, Ordering::Release);
        }
        processed
    }

    fn wait_done(&self, policy: WaitPolicy) -> bool {
        let done = &self.shared.done;
        match policy {
            WaitPolicy::Poll => done.trywait(),
            WaitPolicy::Deadline { micros } => done.wait_timeout(Duration::from_micros(micros)),
            WaitPolicy::Block => loop {
                if done.wait_timeout(BLOCK_POLL) {
                    break true;
                }
                if self.thread.as_ref().is_none_or(JoinHandle::is_finished) {
                    break false;
                }
            },
        }
    }

    /// Advance by one output block, trigger a cycle at partition boundaries
    /// and add this level's contribution into `outbuff`.
    /// Returns true if the level is running late.
    pub fn readout(&mut self, policy: WaitPolicy, skipcnt: usize, outbuff: &mut [Vec<Sample>]) -> bool {
        let parsize = self.shared.plan.parsize;
        let mut missed = false;

        self.outoffs += self.outsize;
        if self.outoffs == parsize {
            self.outoffs = 0;
            if self.threaded {
                while self.wait > 0 {
                    if !self.wait_done(policy) {
                        break;
                    }
                    self.wait -= 1;
                }
                self.opind = (self.opind + 1) % 3;
                if self.shared.trig.post() {
                    self.wait += 1;
                } else {
                    missed = true;
                }
            } else {
                missed = !self.process(skipcnt >= 2 * parsize);
                self.opind = (self.opind + 1) % 3;
            }
        }

        for (ring, out) in self.shared.outrings.iter().zip(outbuff.iter_mut()) {
            if ring.is_active() {
                ring.buff[self.opind].add_into(self.outoffs, &mut out[..self.outsize]);
            }
        }

        let late = missed || self.wait > 1;
        if late {
            self.late += 1;
        }
        late
    }

    /// Stop the worker and drop all impulse data
    pub fn cleanup(&mut self) {
        self.stop();
        self.join();
        self.shared.core.lock().graph.clear();
        for ring in self.shared.outrings.iter() {
            ring.set_active(false);
            ring.clear();
        }
    }

    pub fn print<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let plan = &self.shared.plan;
        writeln!(
            w,
            "prio = {:4}, offs = {:6}, parsize = {:5}, npar = {:3}, {}, late = {}",
            plan.prio,
            plan.offs,
            plan.parsize,
            plan.npar,
            if self.threaded { "thread" } else { "inline" },
            self.late
        )?;
        let core = self.shared.core.lock();
        let graph = &core.graph;
        for (_, y) in graph.outputs.iter() {
            write!(w, "    out {:2}:", y.out)?;
            for &m in &y.macs {
                let mac = &graph.macs[m];
                let inp = graph.inputs[mac.inpn].inp;
                match mac.link {
                    Some(_) => write!(w, " {inp}(link)")?,
                    None => {
                        let used = mac.fftb.iter().filter(|b| b.is_some()).count();
                        write!(w, " {inp}({used}/{})", plan.npar)?
                    }
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

impl Drop for Convlevel {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plan(offs: usize, npar: usize, parsize: usize) -> LevelPlan {
        LevelPlan {
            prio: 0,
            offs,
            npar,
            parsize,
        }
    }

    fn input_ring(len: usize) -> Vec<Arc<SharedBuffer>> {
        vec![Arc::new(SharedBuffer::new(len).unwrap())]
    }

    #[test]
    fn test_write_outside_level_is_noop() {
        let level = Convlevel::configure(plan(128, 2, 64), 1, Options::default(), true).unwrap();
        let data = vec![1.0; 128];
        level.shared().impdata_write(0, 0, 1, &data, 0, 128, true).unwrap();
        level.shared().impdata_write(0, 0, 1, &data, 256, 300, true).unwrap();
        assert!(level.shared().core.lock().graph.macs.is_empty());
        assert!(!level.shared().outrings[0].is_active());
    }

    #[test]
    fn test_write_allocates_only_touched_partitions() {
        let level = Convlevel::configure(plan(0, 4, 64), 1, Options::default(), true).unwrap();
        let data = vec![1.0; 10];
        level.shared().impdata_write(0, 0, 1, &data, 130, 140, true).unwrap();
        let core = level.shared().core.lock();
        let m = core.graph.find_macnode(0, 0).unwrap();
        let used: Vec<bool> = core.graph.macs[m].fftb.iter().map(Option::is_some).collect();
        assert_eq!(used, vec![false, false, true, false]);
    }

    #[test]
    fn test_update_does_not_create() {
        let level = Convlevel::configure(plan(0, 2, 64), 1, Options::default(), true).unwrap();
        level.shared().impdata_write(0, 0, 1, &[1.0], 0, 1, false).unwrap();
        assert!(level.shared().core.lock().graph.macs.is_empty());
    }

    #[test]
    fn test_inline_level_convolves_impulse() {
        // Single inline level: partition size equals the block size
        let mut level = Convlevel::configure(plan(0, 2, 64), 1, Options::default(), false).unwrap();
        let ir: Vec<Sample> = (0..100).map(|i| 1.0 / (i + 1) as Sample).collect();
        level.shared().impdata_write(0, 0, 1, &ir, 0, 100, true).unwrap();

        let ring = input_ring(128);
        level.reset(128, 64, &ring).unwrap();

        let mut produced = Vec::new();
        for block in 0..4 {
            let mut input = [0.0; 64];
            if block == 0 {
                input[0] = 1.0;
            }
            ring[0].write_from((block * 64) % 128, &input);
            let mut outbuff = vec![vec![0.0; 64]];
            assert!(!level.readout(WaitPolicy::Block, 0, &mut outbuff));
            produced.extend_from_slice(&outbuff[0]);
        }

        for (i, y) in produced.iter().enumerate() {
            let expected = if i < 100 { ir[i] } else { 0.0 };
            assert_relative_eq!(*y, expected, epsilon = 1e-12);
        }
        assert_eq!(level.cycles(), 4);
    }

    #[test]
    fn test_worker_start_stop() {
        let mut level = Convlevel::configure(plan(0, 2, 128), 1, Options::default(), true).unwrap();
        let ring = input_ring(256);
        level.reset(256, 64, &ring).unwrap();
        level.start(0, SchedPolicy::Other).unwrap();
        while !level.is_ready() {
            thread::sleep(Duration::from_millis(1));
        }
        let mut outbuff = vec![vec![0.0; 64]];
        for _ in 0..8 {
            level.readout(WaitPolicy::Block, 0, &mut outbuff);
        }
        level.stop();
        level.join();
        assert_eq!(level.stat(), LevelStat::Idle);
        assert!(!level.has_thread());
        assert!(level.cycles() >= 3);
    }

    #[test]
    fn test_print_lists_routes() {
        let level = Convlevel::configure(plan(0, 2, 64), 2, Options::default(), true).unwrap();
        level.shared().impdata_write(1, 0, 1, &[1.0; 64], 0, 64, true).unwrap();
        level.shared().impdata_link(1, 0, 0, 1).unwrap();
        let mut text = Vec::new();
        level.print(&mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("parsize =    64"));
        assert!(text.contains("out  0: 1(1/2)"));
        assert!(text.contains("out  1: 0(link)"));
    }

    #[test]
    fn test_print_reports_inline_before_reset() {
        let inline = Convlevel::configure(plan(0, 2, 64), 1, Options::default(), false).unwrap();
        let threaded = Convlevel::configure(plan(128, 2, 128), 1, Options::default(), true).unwrap();
        let mut text = Vec::new();
        inline.print(&mut text).unwrap();
        threaded.print(&mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("inline"));
        assert!(lines[1].contains("thread"));
        assert!(!inline.is_threaded());
        assert!(inline.is_ready());
    }
}
