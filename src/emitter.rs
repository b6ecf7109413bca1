use crate::block::{BlockSet, BLOCK_LEN, NUM_CHANNELS};
use crate::config::Config;
use crate::utils::DynError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepGate {
    Quiescent,
    DeadZone,
    BeamOn,
}

impl StepGate {
    pub fn classify(current: f32, cfg: &Config) -> Self {
        if current < cfg.quiescent_threshold {
            StepGate::Quiescent
        } else if current > cfg.current_threshold {
            StepGate::BeamOn
        } else {
            StepGate::DeadZone
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MergedSample {
    pub timestamp: f64,
    pub channels: [f32; NUM_CHANNELS],
    pub current: f32,
    pub gain_scale: f32,
}

pub trait RecordSink {
    fn push(&mut self, sample: &MergedSample) -> Result<(), DynError>;
}

impl RecordSink for Vec<MergedSample> {
    fn push(&mut self, sample: &MergedSample) -> Result<(), DynError> {
        Vec::push(self, *sample);
        Ok(())
    }
}

pub struct SampleEmitter {
    sample_interval: f64,
    apply_offsets: bool,
}

impl SampleEmitter {
    pub fn new(cfg: &Config) -> Self {
        Self {
            sample_interval: cfg.sample_interval_s,
            apply_offsets: cfg.apply_sample_offsets,
        }
    }

    pub fn sample_offsets(&self, set: &BlockSet) -> [i64; NUM_CHANNELS] {
        let mut offsets = [0i64; NUM_CHANNELS];
        if self.apply_offsets {
            for (o, &delta) in offsets.iter_mut().zip(set.deltas.iter()) {
                *o = -(delta / self.sample_interval).round() as i64;
            }
        }
        offsets
    }

    pub fn emit<K: RecordSink + ?Sized>(
        &self,
        set: &BlockSet,
        t_ref: f64,
        baseline: &[f64; NUM_CHANNELS],
        sink: &mut K,
    ) -> Result<usize, DynError> {
        let offsets = self.sample_offsets(set);
        let reference = set.reference();
        let current = reference.current;
        let gain_scale = reference.gain_scale();
        let mut written = 0usize;

        'samples: for j in 0..BLOCK_LEN {
            let mut channels = [0f32; NUM_CHANNELS];
            for c in 0..NUM_CHANNELS {
                let k = j as i64 + offsets[c];
                if k < 0 || k >= BLOCK_LEN as i64 {
                    continue 'samples;
                }
                let raw = set.blocks[c].samples()[k as usize] as f64;
                channels[c] = (raw - baseline[c]) as f32;
            }
            sink.push(&MergedSample {
                timestamp: t_ref + j as f64 * self.sample_interval,
                channels,
                current,
                gain_scale,
            })?;
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ChannelBlock;

    fn ramp_set(deltas: [f64; NUM_CHANNELS]) -> BlockSet {
        let blocks = (0..NUM_CHANNELS)
            .map(|c| {
                let samples = (0..BLOCK_LEN).map(|i| (c * 10_000 + i) as f32).collect();
                ChannelBlock::new(10, 0, samples, 25.0, 1).unwrap()
            })
            .collect();
        BlockSet { blocks, deltas }
    }

    #[test]
    fn gate_splits_on_both_thresholds() {
        let cfg = Config::default();
        assert_eq!(StepGate::classify(0.5, &cfg), StepGate::Quiescent);
        assert_eq!(StepGate::classify(5.0, &cfg), StepGate::DeadZone);
        assert_eq!(StepGate::classify(10.0, &cfg), StepGate::DeadZone);
        assert_eq!(StepGate::classify(10.5, &cfg), StepGate::BeamOn);
    }

    #[test]
    fn emits_every_sample_with_baseline_removed() {
        let cfg = Config::default();
        let emitter = SampleEmitter::new(&cfg);
        let set = ramp_set([0.0; NUM_CHANNELS]);
        let mut baseline = [0.0; NUM_CHANNELS];
        baseline[3] = 100.0;
        let mut rows: Vec<MergedSample> = Vec::new();
        let n = emitter.emit(&set, 2.0, &baseline, &mut rows).unwrap();
        assert_eq!(n, BLOCK_LEN);
        assert_eq!(rows.len(), BLOCK_LEN);
        let row = rows[17];
        assert!((row.timestamp - (2.0 + 17.0 * cfg.sample_interval_s)).abs() < 1e-12);
        assert_eq!(row.channels[0], 17.0);
        assert_eq!(row.channels[3], (30_017 - 100) as f32);
        assert_eq!(row.current, 25.0);
        assert_eq!(row.gain_scale, 1e7);
    }

    #[test]
    fn offsets_shift_samples_and_truncate_edges() {
        let mut cfg = Config::default();
        cfg.apply_sample_offsets = true;
        let emitter = SampleEmitter::new(&cfg);
        let mut deltas = [0.0; NUM_CHANNELS];
        // ixm runs 3 samples late, oym 2 samples early.
        deltas[1] = 3.0 * cfg.sample_interval_s;
        deltas[7] = -2.0 * cfg.sample_interval_s;
        let set = ramp_set(deltas);
        assert_eq!(emitter.sample_offsets(&set)[1], -3);
        assert_eq!(emitter.sample_offsets(&set)[7], 2);

        let mut rows: Vec<MergedSample> = Vec::new();
        let n = emitter
            .emit(&set, 0.0, &[0.0; NUM_CHANNELS], &mut rows)
            .unwrap();
        assert_eq!(n, BLOCK_LEN - 5);
        // First surviving index is j = 3.
        assert_eq!(rows[0].channels[0], 3.0);
        assert_eq!(rows[0].channels[1], 10_000.0);
        assert_eq!(rows[0].channels[7], 70_005.0);
    }

    #[test]
    fn offsets_are_ignored_when_disabled() {
        let cfg = Config::default();
        let emitter = SampleEmitter::new(&cfg);
        let mut deltas = [0.0; NUM_CHANNELS];
        deltas[2] = 0.01;
        assert_eq!(emitter.sample_offsets(&ramp_set(deltas)), [0; NUM_CHANNELS]);
    }
}
