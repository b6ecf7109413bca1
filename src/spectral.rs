use std::f64::consts::PI;

use num_complex::Complex;
use rayon::prelude::*;

use crate::block::{BlockSet, BLOCK_LEN, NUM_CHANNELS};
use crate::config::{Config, FrequencyGrid, TimeWindow};
use crate::utils::DynError;

#[derive(Clone, Debug, PartialEq)]
pub struct BinnedAccumulator {
    values: Vec<f64>,
    counts: Vec<u64>,
    finalized: bool,
}

impl BinnedAccumulator {
    pub fn new(bins: usize) -> Self {
        Self {
            values: vec![0.0; bins],
            counts: vec![0; bins],
            finalized: false,
        }
    }

    #[inline]
    pub fn fold(&mut self, bin: usize, value: f64) {
        self.values[bin] += value;
        self.counts[bin] += 1;
    }

    pub fn reset(&mut self) {
        self.values.fill(0.0);
        self.counts.fill(0);
        self.finalized = false;
    }

    /// Divides each value by its count; empty bins stay at zero. Safe to call twice.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        for (v, &n) in self.values.iter_mut().zip(self.counts.iter()) {
            *v = if n > 0 { *v / n as f64 } else { 0.0 };
        }
        self.finalized = true;
    }

    pub fn merge_from(&mut self, other: &BinnedAccumulator) -> Result<(), DynError> {
        if self.finalized || other.finalized {
            return Err("cannot merge finalized histograms".into());
        }
        if self.values.len() != other.values.len() {
            return Err(format!(
                "histogram size mismatch: {} vs {}",
                self.values.len(),
                other.values.len()
            )
            .into());
        }
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            *a += *b;
        }
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += *b;
        }
        Ok(())
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

// `(cos, sin)` phasor advanced by a fixed rotation per sample.
struct PhaseRotation {
    current: Complex<f64>,
    step: Complex<f64>,
}

impl PhaseRotation {
    fn new(scale: f64, phase0: f64, delta_phase: f64) -> Self {
        Self {
            current: Complex::from_polar(scale, phase0),
            step: Complex::from_polar(1.0, delta_phase),
        }
    }

    #[inline(always)]
    fn advance(&mut self) {
        // sm' = sm*cos + cm*sin, cm' = cm*cos - sm*sin
        self.current *= self.step;
    }
}

#[derive(Clone, Debug)]
pub struct SpectralAccumulator {
    grid: FrequencyGrid,
    sample_interval: f64,
    ncoherent: usize,
    window: TimeWindow,
    coherent: Vec<Vec<Complex<f64>>>,
    magnitude: Vec<BinnedAccumulator>,
    steps: u64,
    folds: u64,
}

impl SpectralAccumulator {
    pub fn new(cfg: &Config) -> Self {
        let grid = cfg.frequency_grid();
        Self {
            grid,
            sample_interval: cfg.sample_interval_s,
            ncoherent: cfg.ncoherent,
            window: cfg.accumulation_window,
            coherent: vec![vec![Complex::new(0.0, 0.0); grid.bins]; NUM_CHANNELS],
            magnitude: vec![BinnedAccumulator::new(grid.bins); NUM_CHANNELS],
            steps: 0,
            folds: 0,
        }
    }

    pub fn grid(&self) -> &FrequencyGrid {
        &self.grid
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn folds(&self) -> u64 {
        self.folds
    }

    pub fn channel(&self, channel: usize) -> &BinnedAccumulator {
        &self.magnitude[channel]
    }

    pub fn accumulate(
        &mut self,
        set: &BlockSet,
        t0: f64,
        baseline: &[f64; NUM_CHANNELS],
    ) -> Result<(), DynError> {
        if set.blocks.len() != NUM_CHANNELS {
            return Err(format!(
                "spectral step needs {NUM_CHANNELS} blocks, got {}",
                set.blocks.len()
            )
            .into());
        }
        let samples: Vec<Vec<f64>> = set
            .blocks
            .iter()
            .zip(baseline.iter())
            .map(|(b, &base)| b.samples().iter().map(|&x| x as f64 - base).collect())
            .collect();

        let inv_n = 1.0 / BLOCK_LEN as f64;
        let grid = self.grid;
        let dt = self.sample_interval;
        let partials: Vec<[Complex<f64>; NUM_CHANNELS]> = (0..grid.bins)
            .into_par_iter()
            .map(|k| {
                let f = grid.frequency(k);
                let mut rot = PhaseRotation::new(inv_n, 2.0 * PI * f * t0, 2.0 * PI * f * dt);
                let mut sums = [Complex::new(0.0, 0.0); NUM_CHANNELS];
                for j in 0..BLOCK_LEN {
                    let p = rot.current;
                    for (sum, ch) in sums.iter_mut().zip(samples.iter()) {
                        // re carries the cosine sum, im the sine sum.
                        *sum += p * ch[j];
                    }
                    rot.advance();
                }
                sums
            })
            .collect();

        for (k, sums) in partials.iter().enumerate() {
            for (c, z) in sums.iter().enumerate() {
                self.coherent[c][k] += *z;
            }
        }

        self.steps += 1;
        if self.steps % self.ncoherent as u64 == 0 {
            if self.window.contains(t0) {
                for (coh, hist) in self.coherent.iter().zip(self.magnitude.iter_mut()) {
                    for (k, z) in coh.iter().enumerate() {
                        hist.fold(k, z.norm());
                    }
                }
                self.folds += 1;
            }
            for coh in self.coherent.iter_mut() {
                coh.fill(Complex::new(0.0, 0.0));
            }
        }
        Ok(())
    }

    pub fn finalize(&mut self) {
        for hist in self.magnitude.iter_mut() {
            hist.finalize();
        }
    }

    pub fn merge_from(&mut self, other: &SpectralAccumulator) -> Result<(), DynError> {
        if self.grid != other.grid {
            return Err("cannot merge spectra on different frequency grids".into());
        }
        for (mine, theirs) in self.magnitude.iter_mut().zip(other.magnitude.iter()) {
            mine.merge_from(theirs)?;
        }
        self.steps += other.steps;
        self.folds += other.folds;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ChannelBlock;
    use rustfft::FftPlanner;

    // dt = 1/8192 gives one-second blocks and a 1 Hz grid.
    fn unit_cfg(fmax: f64, ncoherent: usize) -> Config {
        Config {
            sample_interval_s: 1.0 / BLOCK_LEN as f64,
            max_frequency_hz: fmax,
            ncoherent,
            ..Config::default()
        }
    }

    fn set_from(samples: Vec<f32>) -> BlockSet {
        let blocks = (0..NUM_CHANNELS)
            .map(|_| ChannelBlock::new(0, 0, samples.clone(), 50.0, 0).unwrap())
            .collect();
        BlockSet {
            blocks,
            deltas: [0.0; NUM_CHANNELS],
        }
    }

    fn sine(amplitude: f64, freq: f64, dt: f64) -> Vec<f32> {
        (0..BLOCK_LEN)
            .map(|j| (amplitude * (2.0 * PI * freq * j as f64 * dt).sin()) as f32)
            .collect()
    }

    #[test]
    fn on_grid_sinusoid_gives_half_amplitude() {
        let cfg = unit_cfg(16.0, 1);
        let mut acc = SpectralAccumulator::new(&cfg);
        assert_eq!(acc.grid().bins, 16);
        let set = set_from(sine(2.0, 5.0, cfg.sample_interval_s));
        acc.accumulate(&set, 0.0, &[0.0; NUM_CHANNELS]).unwrap();
        acc.finalize();
        for c in 0..NUM_CHANNELS {
            let mags = acc.channel(c).values();
            assert!((mags[5] - 1.0).abs() < 1e-5, "bin 5 = {}", mags[5]);
            for (k, &m) in mags.iter().enumerate() {
                if k != 5 {
                    assert!(m < 1e-4, "bin {k} leaked {m}");
                }
            }
        }
    }

    #[test]
    fn dc_bin_is_block_mean() {
        let cfg = unit_cfg(0.5, 1);
        let mut acc = SpectralAccumulator::new(&cfg);
        assert_eq!(acc.grid().bins, 1);
        let samples = (0..BLOCK_LEN).map(|j| (j % 4) as f32).collect();
        let set = set_from(samples);
        let mut baseline = [0.0; NUM_CHANNELS];
        baseline[2] = 0.5;
        acc.accumulate(&set, 3.0, &baseline).unwrap();
        acc.finalize();
        assert!((acc.channel(0).values()[0] - 1.5).abs() < 1e-9);
        assert!((acc.channel(2).values()[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn coherent_steps_add_in_phase_and_cancel_out_of_phase() {
        let cfg = unit_cfg(8.0, 2);
        let set = set_from(sine(2.0, 5.0, cfg.sample_interval_s));
        let zero = [0.0; NUM_CHANNELS];

        // Whole-second offsets keep the 5 Hz phase, so the pair adds coherently.
        let mut acc = SpectralAccumulator::new(&cfg);
        acc.accumulate(&set, 0.0, &zero).unwrap();
        acc.accumulate(&set, 1.0, &zero).unwrap();
        assert_eq!(acc.channel(0).counts()[5], 1);
        acc.finalize();
        assert!((acc.channel(0).values()[5] - 2.0).abs() < 1e-5);

        // A 0.1 s offset flips the 5 Hz phasor by pi.
        let mut acc = SpectralAccumulator::new(&cfg);
        acc.accumulate(&set, 0.0, &zero).unwrap();
        acc.accumulate(&set, 0.1, &zero).unwrap();
        acc.finalize();
        assert!(acc.channel(0).values()[5] < 1e-5);
    }

    #[test]
    fn non_coherent_steps_average_magnitudes() {
        let cfg = unit_cfg(8.0, 1);
        let set = set_from(sine(2.0, 5.0, cfg.sample_interval_s));
        let mut acc = SpectralAccumulator::new(&cfg);
        acc.accumulate(&set, 0.0, &[0.0; NUM_CHANNELS]).unwrap();
        acc.accumulate(&set, 0.1, &[0.0; NUM_CHANNELS]).unwrap();
        assert_eq!(acc.folds(), 2);
        acc.finalize();
        assert!((acc.channel(0).values()[5] - 1.0).abs() < 1e-5);
        assert_eq!(acc.channel(0).counts()[5], 2);
    }

    #[test]
    fn steps_outside_window_are_not_folded() {
        let mut cfg = unit_cfg(4.0, 1);
        cfg.accumulation_window = TimeWindow {
            start: 10.0,
            end: 20.0,
        };
        let set = set_from(vec![1.0; BLOCK_LEN]);
        let mut acc = SpectralAccumulator::new(&cfg);
        acc.accumulate(&set, 0.0, &[0.0; NUM_CHANNELS]).unwrap();
        acc.accumulate(&set, 12.0, &[0.0; NUM_CHANNELS]).unwrap();
        assert_eq!(acc.channel(0).counts()[0], 1);
        assert_eq!(acc.folds(), 1);
        // The out-of-window step was discarded, not carried into the next fold.
        acc.finalize();
        assert!((acc.channel(0).values()[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn finalize_is_idempotent_and_empty_bins_stay_zero() {
        let mut hist = BinnedAccumulator::new(3);
        hist.fold(0, 4.0);
        hist.fold(0, 2.0);
        hist.finalize();
        let once = hist.clone();
        hist.finalize();
        assert_eq!(hist, once);
        assert_eq!(hist.values(), &[3.0, 0.0, 0.0]);
        assert!(hist.merge_from(&BinnedAccumulator::new(3)).is_err());
        hist.reset();
        assert!(!hist.is_finalized());
    }

    #[test]
    fn merged_workers_sum_histograms() {
        let cfg = unit_cfg(8.0, 1);
        let set = set_from(sine(2.0, 3.0, cfg.sample_interval_s));
        let zero = [0.0; NUM_CHANNELS];
        let mut a = SpectralAccumulator::new(&cfg);
        let mut b = SpectralAccumulator::new(&cfg);
        a.accumulate(&set, 0.0, &zero).unwrap();
        b.accumulate(&set, 5.0, &zero).unwrap();
        b.accumulate(&set, 6.0, &zero).unwrap();
        a.merge_from(&b).unwrap();
        assert_eq!(a.channel(4).counts()[3], 3);
        assert_eq!(a.steps(), 3);
        a.finalize();
        assert!((a.channel(4).values()[3] - 1.0).abs() < 1e-5);

        let other = SpectralAccumulator::new(&unit_cfg(20.0, 1));
        assert!(a.merge_from(&other).is_err());
    }

    #[test]
    fn matches_reference_fft_bins() {
        let cfg = unit_cfg(40.0, 1);
        let mut state = 0x2545_f491u32;
        let samples: Vec<f32> = (0..BLOCK_LEN)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect();
        let mut acc = SpectralAccumulator::new(&cfg);
        acc.accumulate(&set_from(samples.clone()), 0.0, &[0.0; NUM_CHANNELS])
            .unwrap();
        acc.finalize();

        let mut buffer: Vec<rustfft::num_complex::Complex<f64>> = samples
            .iter()
            .map(|&x| rustfft::num_complex::Complex::new(x as f64, 0.0))
            .collect();
        FftPlanner::new()
            .plan_fft_forward(BLOCK_LEN)
            .process(&mut buffer);
        for k in 0..acc.grid().bins {
            let expected = buffer[k].norm() / BLOCK_LEN as f64;
            let got = acc.channel(1).values()[k];
            assert!((got - expected).abs() < 1e-9, "bin {k}: {got} vs {expected}");
        }
    }
}
