//! pconv diagnostic tool
//!
//! Usage:
//!   pconv schedule [--config FILE] [flags]   - Show the partition schedule
//!   pconv run [--config FILE] [flags]        - Render a sine through a synthetic response
//!   pconv config                             - Print the default configuration as JSON
//!
//! Built with `--features cli`.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use pconv_engine::{ConvConfig, Convproc, PartitionSchedule, ProcessOutcome, Sample};

#[derive(Parser)]
#[command(name = "pconv", about = "Partitioned convolution engine diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the partition schedule for a configuration
    Schedule(EngineArgs),
    /// Render a sine through a synthetic decaying response
    Run {
        #[command(flatten)]
        engine: EngineArgs,
        /// Number of quanta to process
        #[arg(long, default_value_t = 2000)]
        quanta: usize,
        /// Impulse response length in samples (defaults to maxsize)
        #[arg(long)]
        ir_length: Option<usize>,
        /// RT60-style decay time of the response, seconds
        #[arg(long, default_value_t = 1.0)]
        decay: f64,
        /// Test tone frequency, Hz
        #[arg(long, default_value_t = 1000.0)]
        frequency: f64,
        /// Sample rate used to interpret decay and frequency
        #[arg(long, default_value_t = 48000.0)]
        sample_rate: f64,
    },
    /// Print the default configuration as JSON
    Config,
}

#[derive(Args)]
struct EngineArgs {
    /// JSON configuration file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    ninp: Option<usize>,
    #[arg(long)]
    nout: Option<usize>,
    #[arg(long)]
    maxsize: Option<usize>,
    #[arg(long)]
    quantum: Option<usize>,
    #[arg(long)]
    minpart: Option<usize>,
    #[arg(long)]
    maxpart: Option<usize>,
    #[arg(long)]
    density: Option<f32>,
}

impl EngineArgs {
    fn load(&self) -> Result<ConvConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                ConvConfig::from_json(&json).with_context(|| format!("parsing {}", path.display()))?
            }
            None => ConvConfig::default(),
        };
        config.ninp = self.ninp.unwrap_or(config.ninp);
        config.nout = self.nout.unwrap_or(config.nout);
        config.maxsize = self.maxsize.unwrap_or(config.maxsize);
        config.quantum = self.quantum.unwrap_or(config.quantum);
        config.minpart = self.minpart.unwrap_or(config.minpart);
        config.maxpart = self.maxpart.unwrap_or(config.maxpart);
        config.density = self.density.unwrap_or(config.density);
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Schedule(args) => show_schedule(&args.load()?),
        Commands::Run {
            engine,
            quanta,
            ir_length,
            decay,
            frequency,
            sample_rate,
        } => {
            let config = engine.load()?;
            let ir_length = ir_length.unwrap_or(config.maxsize);
            if ir_length > config.maxsize {
                bail!("ir length {ir_length} exceeds maxsize {}", config.maxsize);
            }
            run(&config, quanta, ir_length, decay * sample_rate, frequency, sample_rate)
        }
        Commands::Config => {
            println!("{}", ConvConfig::default().to_json()?);
            Ok(())
        }
    }
}

fn show_schedule(config: &ConvConfig) -> Result<()> {
    let schedule = PartitionSchedule::plan(config)?;
    println!(
        "{} level(s), density {:.3}, coverage {} samples",
        schedule.levels.len(),
        config.effective_density(),
        schedule.coverage()
    );
    for level in &schedule.levels {
        println!(
            "  prio {:3}  offs {:7}  parsize {:5}  npar {:4}",
            level.prio, level.offs, level.parsize, level.npar
        );
    }
    Ok(())
}

/// Exponentially decaying noise, -60 dB after `decay` samples
fn synthetic_response(len: usize, decay: f64, seed: u64) -> Vec<Sample> {
    let rate = (1e-3f64).ln() / decay.max(1.0);
    let mut state = seed | 1;
    (0..len)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let noise = (state >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0;
            noise * (rate * i as f64).exp()
        })
        .collect()
}

fn run(
    config: &ConvConfig,
    quanta: usize,
    ir_length: usize,
    decay: f64,
    frequency: f64,
    sample_rate: f64,
) -> Result<()> {
    let mut proc = Convproc::from_config(config)?;
    for out in 0..config.nout {
        let inp = out % config.ninp;
        let ir = synthetic_response(ir_length, decay, (inp * 64 + out + 1) as u64);
        proc.impdata_create(inp, out, 1, &ir, 0, ir.len())?;
    }
    proc.start_process(config.priority, config.policy)?;

    let q = config.quantum;
    let cycles = frequency / sample_rate;
    let mut phase = 0.0f64;
    let mut peak = 0.0f64;
    let mut late_quanta = 0usize;
    let started = Instant::now();
    for _ in 0..quanta {
        for k in 0..config.ninp {
            let input = proc.inpdata(k);
            for (i, x) in input.iter_mut().enumerate() {
                *x = (2.0 * std::f64::consts::PI * (phase + i as f64 * cycles)).sin();
            }
        }
        phase = (phase + q as f64 * cycles).fract();
        if let ProcessOutcome::LateCompletion(_) = proc.process() {
            late_quanta += 1;
        }
        for k in 0..config.nout {
            peak = proc.outdata(k).iter().fold(peak, |m, v| m.max(v.abs()));
        }
    }
    let elapsed = started.elapsed();
    proc.stop_process()?;

    let audio_secs = (quanta * q) as f64 / sample_rate;
    proc.print(&mut io::stdout())?;
    println!(
        "{} quanta in {:.3} s ({:.1}x real time at {} Hz), peak {:.4}, late quanta {}",
        quanta,
        elapsed.as_secs_f64(),
        audio_secs / elapsed.as_secs_f64().max(1e-9),
        sample_rate,
        peak,
        late_quanta
    );
    proc.cleanup();
    Ok(())
}
