use crate::block::BLOCK_LEN;
use crate::utils::DynError;

pub const DEFAULT_SYNC_WINDOW_S: f64 = 0.8;
pub const DEFAULT_SYNC_MAX_STEPS: usize = 999;
/// 32 ADC ticks at 500 kHz per stored sample.
pub const DEFAULT_SAMPLE_INTERVAL_S: f64 = 32.0 / 500_000.0;
pub const DEFAULT_MAX_FREQUENCY_HZ: f64 = 500.0;
pub const DEFAULT_NCOHERENT: usize = 10;
pub const DEFAULT_CURRENT_THRESHOLD: f32 = 10.0;
pub const DEFAULT_QUIESCENT_THRESHOLD: f32 = 1.0;
pub const DEFAULT_BASELINE_MEMORY: f64 = 100.0;
pub const DEFAULT_DRIFT_PRECISION: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub const UNBOUNDED: TimeWindow = TimeWindow {
        start: f64::NEG_INFINITY,
        end: f64::INFINITY,
    };

    #[inline]
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub sync_window_s: Option<f64>,
    pub sync_max_steps: Option<usize>,
    pub sample_interval_s: Option<f64>,
    pub max_frequency_hz: Option<f64>,
    pub ncoherent: Option<usize>,
    pub current_threshold: Option<f32>,
    pub quiescent_threshold: Option<f32>,
    pub baseline_memory: Option<f64>,
    pub window_start_s: Option<f64>,
    pub window_end_s: Option<f64>,
    pub apply_sample_offsets: Option<bool>,
    pub drift_precision: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub sync_window_s: f64,
    pub sync_max_steps: usize,
    pub sample_interval_s: f64,
    pub max_frequency_hz: f64,
    pub ncoherent: usize,
    pub current_threshold: f32,
    pub quiescent_threshold: f32,
    pub baseline_memory: f64,
    pub accumulation_window: TimeWindow,
    pub apply_sample_offsets: bool,
    pub drift_precision: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_window_s: DEFAULT_SYNC_WINDOW_S,
            sync_max_steps: DEFAULT_SYNC_MAX_STEPS,
            sample_interval_s: DEFAULT_SAMPLE_INTERVAL_S,
            max_frequency_hz: DEFAULT_MAX_FREQUENCY_HZ,
            ncoherent: DEFAULT_NCOHERENT,
            current_threshold: DEFAULT_CURRENT_THRESHOLD,
            quiescent_threshold: DEFAULT_QUIESCENT_THRESHOLD,
            baseline_memory: DEFAULT_BASELINE_MEMORY,
            accumulation_window: TimeWindow::UNBOUNDED,
            apply_sample_offsets: false,
            drift_precision: DEFAULT_DRIFT_PRECISION,
        }
    }
}

impl Config {
    pub fn from_layers(cli: &ConfigOverrides, file: &ConfigOverrides) -> Result<Self, DynError> {
        let d = Config::default();
        let window = TimeWindow {
            start: cli
                .window_start_s
                .or(file.window_start_s)
                .unwrap_or(d.accumulation_window.start),
            end: cli
                .window_end_s
                .or(file.window_end_s)
                .unwrap_or(d.accumulation_window.end),
        };
        let cfg = Config {
            sync_window_s: cli.sync_window_s.or(file.sync_window_s).unwrap_or(d.sync_window_s),
            sync_max_steps: cli
                .sync_max_steps
                .or(file.sync_max_steps)
                .unwrap_or(d.sync_max_steps),
            sample_interval_s: cli
                .sample_interval_s
                .or(file.sample_interval_s)
                .unwrap_or(d.sample_interval_s),
            max_frequency_hz: cli
                .max_frequency_hz
                .or(file.max_frequency_hz)
                .unwrap_or(d.max_frequency_hz),
            ncoherent: cli.ncoherent.or(file.ncoherent).unwrap_or(d.ncoherent),
            current_threshold: cli
                .current_threshold
                .or(file.current_threshold)
                .unwrap_or(d.current_threshold),
            quiescent_threshold: cli
                .quiescent_threshold
                .or(file.quiescent_threshold)
                .unwrap_or(d.quiescent_threshold),
            baseline_memory: cli
                .baseline_memory
                .or(file.baseline_memory)
                .unwrap_or(d.baseline_memory),
            accumulation_window: window,
            apply_sample_offsets: cli
                .apply_sample_offsets
                .or(file.apply_sample_offsets)
                .unwrap_or(d.apply_sample_offsets),
            drift_precision: cli
                .drift_precision
                .or(file.drift_precision)
                .unwrap_or(d.drift_precision),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), DynError> {
        if !(self.sync_window_s > 0.0) {
            return Err("sync window must be positive".into());
        }
        if !(self.sample_interval_s > 0.0) {
            return Err("sample interval must be positive".into());
        }
        if !(self.max_frequency_hz > 0.0) {
            return Err("maximum frequency must be positive".into());
        }
        if self.ncoherent == 0 {
            return Err("ncoherent must be at least 1".into());
        }
        if !(self.baseline_memory >= 1.0) {
            return Err("baseline memory must be at least 1".into());
        }
        if self.quiescent_threshold > self.current_threshold {
            return Err(format!(
                "quiescent threshold ({}) exceeds current threshold ({})",
                self.quiescent_threshold, self.current_threshold
            )
            .into());
        }
        if self.accumulation_window.start > self.accumulation_window.end {
            return Err("accumulation window start is after its end".into());
        }
        if !(self.drift_precision > 0.0 && self.drift_precision < 1.0) {
            return Err("drift precision must lie in (0, 1)".into());
        }
        Ok(())
    }

    #[inline]
    pub fn block_duration_s(&self) -> f64 {
        BLOCK_LEN as f64 * self.sample_interval_s
    }

    pub fn frequency_grid(&self) -> FrequencyGrid {
        FrequencyGrid::new(self.block_duration_s(), self.max_frequency_hz)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrequencyGrid {
    pub df_hz: f64,
    pub bins: usize,
}

impl FrequencyGrid {
    pub fn new(block_duration_s: f64, max_frequency_hz: f64) -> Self {
        let df_hz = 1.0 / block_duration_s;
        let bins = ((max_frequency_hz / df_hz).ceil() as usize).max(1);
        Self { df_hz, bins }
    }

    #[inline]
    pub fn frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.df_hz
    }

    pub fn frequencies(&self) -> Vec<f64> {
        (0..self.bins).map(|k| self.frequency(k)).collect()
    }
}
