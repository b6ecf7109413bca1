use std::ops::{AddAssign, Range};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::baseline::BaselineTracker;
use crate::block::{BlockSource, REFERENCE_CHANNEL};
use crate::config::Config;
use crate::emitter::{RecordSink, SampleEmitter, StepGate};
use crate::spectral::SpectralAccumulator;
use crate::sync::{log_step_failure, DriftTracker, SyncFailure, Synchronizer};
use crate::utils::{split_contiguous, DynError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub steps: u64,
    pub quiescent: u64,
    pub dead_zone: u64,
    pub beam_on: u64,
    pub search_exhausted: u64,
    pub no_sync: u64,
    pub rows: u64,
    pub baseline_updates: u64,
}

impl RunStats {
    pub fn sync_failures(&self) -> u64 {
        self.search_exhausted + self.no_sync
    }
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, o: Self) {
        self.steps += o.steps;
        self.quiescent += o.quiescent;
        self.dead_zone += o.dead_zone;
        self.beam_on += o.beam_on;
        self.search_exhausted += o.search_exhausted;
        self.no_sync += o.no_sync;
        self.rows += o.rows;
        self.baseline_updates += o.baseline_updates;
    }
}

pub struct RunState {
    pub base_seconds: i64,
    pub baseline: BaselineTracker,
    pub spectra: SpectralAccumulator,
    pub drift: DriftTracker,
    pub stats: RunStats,
}

impl RunState {
    pub fn new(cfg: &Config, base_seconds: i64) -> Self {
        Self {
            base_seconds,
            baseline: BaselineTracker::new(cfg.baseline_memory, cfg.quiescent_threshold),
            spectra: SpectralAccumulator::new(cfg),
            drift: DriftTracker::default(),
            stats: RunStats::default(),
        }
    }

    pub fn merge_from(&mut self, other: &RunState) -> Result<(), DynError> {
        self.spectra.merge_from(&other.spectra)?;
        self.drift.merge_from(&other.drift);
        self.stats += other.stats;
        Ok(())
    }
}

pub fn capture_base_seconds<S: BlockSource>(
    source: &mut S,
    first_step: usize,
) -> Result<i64, DynError> {
    if source.channel_len(REFERENCE_CHANNEL) <= first_step {
        return Err(format!("reference channel has no block {first_step}").into());
    }
    Ok(source.read_block(REFERENCE_CHANNEL, first_step)?.seconds)
}

pub struct Pipeline<'a> {
    cfg: &'a Config,
    emitter: SampleEmitter,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Self {
            cfg,
            emitter: SampleEmitter::new(cfg),
        }
    }

    pub fn run_steps<S: BlockSource, K: RecordSink + ?Sized>(
        &self,
        state: &mut RunState,
        source: &mut S,
        steps: Range<usize>,
        sink: &mut K,
    ) -> Result<(), DynError> {
        let mut sync = Synchronizer::new(self.cfg, state.base_seconds);
        let end = steps.end.min(source.channel_len(REFERENCE_CHANNEL));
        for step in steps.start..end {
            let reference = source.read_block(REFERENCE_CHANNEL, step)?;
            state.stats.steps += 1;
            let gate = StepGate::classify(reference.current, self.cfg);
            if gate == StepGate::DeadZone {
                state.stats.dead_zone += 1;
                continue;
            }
            let t_ref = reference.time(state.base_seconds);
            let set = match sync.align_step(source, step, reference)? {
                Ok(set) => set,
                Err(failure) => {
                    log_step_failure(step, &failure);
                    match failure.failure {
                        SyncFailure::SearchExhausted { .. } => state.stats.search_exhausted += 1,
                        SyncFailure::NoSync { .. } => state.stats.no_sync += 1,
                    }
                    continue;
                }
            };
            match gate {
                StepGate::Quiescent => {
                    if state.baseline.update_from_blocks(&set) {
                        state.stats.baseline_updates += 1;
                        debug!(
                            "[baseline] step {step}: update {} reference offset {:.4}",
                            state.baseline.updates(),
                            state.baseline.values()[REFERENCE_CHANNEL]
                        );
                    }
                    state.stats.quiescent += 1;
                }
                StepGate::BeamOn => {
                    let baseline = *state.baseline.values();
                    let rows = self.emitter.emit(&set, t_ref, &baseline, sink)?;
                    state.spectra.accumulate(&set, t_ref, &baseline)?;
                    state.stats.beam_on += 1;
                    state.stats.rows += rows as u64;
                }
                StepGate::DeadZone => {}
            }
        }
        state.drift.merge_from(sync.drift());
        Ok(())
    }

    pub fn run_partitioned<S, K, OS, OK>(
        &self,
        base_seconds: i64,
        steps: Range<usize>,
        workers: usize,
        open_source: OS,
        open_sink: OK,
    ) -> Result<(RunState, Vec<K>), DynError>
    where
        S: BlockSource,
        K: RecordSink + Send,
        OS: Fn() -> Result<S, DynError> + Sync,
        OK: Fn(usize) -> Result<K, DynError> + Sync,
    {
        let ranges = split_contiguous(steps, workers.max(1));
        if ranges.is_empty() {
            return Err("no steps to process".into());
        }
        if ranges.len() > 1 {
            warn!(
                "[workers] {} workers: baselines restart at zero at each range boundary",
                ranges.len()
            );
        }
        let results = ranges
            .par_iter()
            .enumerate()
            .map(|(k, range)| -> Result<(RunState, K), DynError> {
                let mut source = open_source()?;
                let mut sink = open_sink(k)?;
                let mut state = RunState::new(self.cfg, base_seconds);
                self.run_steps(&mut state, &mut source, range.clone(), &mut sink)?;
                info!(
                    "[workers] worker {k} steps {}..{}: {} beam-on, {} baseline updates, {} rows",
                    range.start,
                    range.end,
                    state.stats.beam_on,
                    state.stats.baseline_updates,
                    state.stats.rows
                );
                Ok((state, sink))
            })
            .collect::<Result<Vec<(RunState, K)>, DynError>>()?;

        let mut iter = results.into_iter();
        let (mut merged, first_sink) = iter.next().ok_or("no worker results")?;
        let mut sinks = vec![first_sink];
        for (state, sink) in iter {
            merged.merge_from(&state)?;
            sinks.push(sink);
        }
        Ok((merged, sinks))
    }
}
