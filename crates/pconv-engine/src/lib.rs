//! pconv-engine: Real-time multi-channel partitioned convolution
//!
//! Convolves up to 64 inputs with up to 64 outputs through per-pair impulse
//! responses using non-uniform partitioned FFT convolution:
//! - small partitions at the head of the response, processed every
//!   quantum, keep latency low
//! - larger partitions further out run on background threads with
//!   progressively lower priority
//!
//! ```no_run
//! use pconv_engine::{Convproc, SchedPolicy};
//!
//! let mut proc = Convproc::new();
//! proc.configure(1, 1, 48000, 64, 64, 8192, 1.0)?;
//! let ir = vec![0.0; 48000];
//! proc.impdata_create(0, 0, 1, &ir, 0, ir.len())?;
//! proc.start_process(0, SchedPolicy::Other)?;
//! proc.inpdata(0).fill(0.5);
//! let _ = proc.process();
//! let _out = proc.outdata(0);
//! proc.stop_process()?;
//! # Ok::<(), pconv_engine::ConvError>(())
//! ```

pub mod convproc;
pub mod editor;
mod fft;
pub mod level;
pub mod node;
mod priority;
pub mod schedule;
pub mod semaphore;
mod shared;

pub use convproc::{Convproc, MAX_LATE_CYCLES, ProcessOutcome};
pub use editor::ImpulseEditor;
pub use level::{Convlevel, LevelStat};
pub use pconv_core::*;
pub use schedule::{LevelPlan, PartitionSchedule};
pub use semaphore::Semaphore;
pub use shared::SharedBuffer;
