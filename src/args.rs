use std::path::PathBuf;

use clap::Parser;

use crate::block::channel_index;
use crate::config::ConfigOverrides;
use crate::utils::DynError;

pub const DEFAULT_OUTPUT_DIR: &str = "ac_serial_out";
pub const DEFAULT_TRANSIT_PLOTS: usize = 20;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Aligns the eight collimator wedge current logs and accumulates their spectra",
    long_about = None,
    after_help = "Examples:\n  ac_serial --data run0421 --output out0421\n  ac_serial --config run0421.cfg --ncoherent 20 --fmax 250\n  ac_serial --data run0421 --window-start 30 --window-end 90 --transits\n  ac_serial --input ixp.raw,ixm.raw,iyp.raw,iym.raw,oxp.raw,oxm.raw,oyp.raw,oym.raw --workers 4\n"
)]
pub struct Args {
    /// Eight channel block logs in order ixp,ixm,iyp,iym,oxp,oxm,oyp,oym
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub input: Vec<PathBuf>,

    /// Directory holding N9_raw_XP.raw ... N10_raw_YM.raw
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Run file with key=value settings (CLI flags take precedence)
    #[arg(long, visible_alias = "cfg")]
    pub config: Option<PathBuf>,

    /// Output directory for merged records, spectra and plots
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Largest |t_channel - t_ref| accepted as aligned (seconds)
    #[arg(long = "sync-window", visible_alias = "sync-delta")]
    pub sync_window: Option<f64>,

    /// Step budget for the per-channel alignment search
    #[arg(long = "sync-steps")]
    pub sync_steps: Option<usize>,

    /// Time between stored samples (seconds)
    #[arg(long = "sample-interval", visible_alias = "fadc-delta")]
    pub sample_interval: Option<f64>,

    /// Highest spectral bin frequency (Hz)
    #[arg(long)]
    pub fmax: Option<f64>,

    /// Block steps summed coherently before taking magnitudes
    #[arg(long)]
    pub ncoherent: Option<usize>,

    /// Beam-on threshold on the reference current (nA)
    #[arg(long = "current-threshold")]
    pub current_threshold: Option<f32>,

    /// Baseline calibration threshold on the reference current (nA)
    #[arg(long = "quiescent-threshold")]
    pub quiescent_threshold: Option<f32>,

    /// Baseline filter memory in updates
    #[arg(long = "baseline-memory")]
    pub baseline_memory: Option<f64>,

    /// Start of the spectral accumulation window (run seconds)
    #[arg(long = "window-start", allow_hyphen_values = true)]
    pub window_start: Option<f64>,

    /// End of the spectral accumulation window (run seconds)
    #[arg(long = "window-end", allow_hyphen_values = true)]
    pub window_end: Option<f64>,

    /// Shift each channel by its whole-sample residual delay before merging
    #[arg(long = "sample-offsets", visible_alias = "joffset")]
    pub sample_offsets: bool,

    /// Precision of the drift ratio fractions in the log
    #[arg(long = "drift-precision")]
    pub drift_precision: Option<f64>,

    /// First reference block to process
    #[arg(long = "start-block", default_value_t = 0)]
    pub start_block: usize,

    /// Number of reference blocks to process (default: all)
    #[arg(long)]
    pub blocks: Option<usize>,

    /// Parallel workers over contiguous block ranges
    #[arg(long, visible_alias = "cpu", default_value_t = 1)]
    pub workers: usize,

    /// Skip the spectrum PNG
    #[arg(long = "no-plot")]
    pub no_plot: bool,

    /// Scan the merged records for beam transits after the run
    #[arg(long)]
    pub transits: bool,

    /// Current step that counts as a transit
    #[arg(long = "transit-threshold", default_value_t = 200.0)]
    pub transit_threshold: f32,

    /// Channel watched by the transit scanner
    #[arg(long = "transit-channel", default_value = "ixp")]
    pub transit_channel: String,

    /// Maximum number of transit windows to plot
    #[arg(long = "transit-plots", default_value_t = DEFAULT_TRANSIT_PLOTS)]
    pub transit_plots: usize,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl Args {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            sync_window_s: self.sync_window,
            sync_max_steps: self.sync_steps,
            sample_interval_s: self.sample_interval,
            max_frequency_hz: self.fmax,
            ncoherent: self.ncoherent,
            current_threshold: self.current_threshold,
            quiescent_threshold: self.quiescent_threshold,
            baseline_memory: self.baseline_memory,
            window_start_s: self.window_start,
            window_end_s: self.window_end,
            apply_sample_offsets: self.sample_offsets.then_some(true),
            drift_precision: self.drift_precision,
        }
    }
}

pub fn parse_channel(name: &str) -> Result<usize, DynError> {
    channel_index(name).ok_or_else(|| {
        format!("unknown channel '{name}' (expected one of ixp,ixm,iyp,iym,oxp,oxm,oyp,oym)")
            .into()
    })
}
