use tracing::{debug, info, warn};

use crate::block::{
    BlockSet, BlockSource, ChannelBlock, CHANNEL_NAMES, NUM_CHANNELS, REFERENCE_CHANNEL,
};
use crate::config::Config;
use crate::rational::RatioFormat;
use crate::utils::DynError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchSpan {
    pub first_index: usize,
    pub first_time: f64,
    pub last_index: usize,
    pub last_time: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SyncFailure {
    /// Step budget spent, or the channel start/end reached, before bracketing.
    /// `searched` is `None` for an empty channel.
    SearchExhausted {
        steps: usize,
        best_delta: f64,
        searched: Option<SearchSpan>,
    },
    NoSync {
        best_delta: f64,
        searched: Option<SearchSpan>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SyncResult {
    Aligned { index: usize, delta: f64 },
    Failed(SyncFailure),
}

#[derive(Clone, Copy, Debug)]
pub struct StepFailure {
    pub channel: usize,
    pub reference_time: f64,
    pub failure: SyncFailure,
}

pub struct Synchronizer {
    sync_window: f64,
    max_steps: usize,
    base_seconds: i64,
    // `aligned_index - reference_index` from the last fully aligned step.
    offsets: [i64; NUM_CHANNELS],
    drift: DriftTracker,
}

impl Synchronizer {
    pub fn new(cfg: &Config, base_seconds: i64) -> Self {
        Self {
            sync_window: cfg.sync_window_s,
            max_steps: cfg.sync_max_steps,
            base_seconds,
            offsets: [0; NUM_CHANNELS],
            drift: DriftTracker::default(),
        }
    }

    pub fn drift(&self) -> &DriftTracker {
        &self.drift
    }

    pub fn align<S: BlockSource>(
        &mut self,
        source: &mut S,
        reference_index: usize,
        reference: &ChannelBlock,
    ) -> Result<[SyncResult; NUM_CHANNELS - 1], DynError> {
        let t_ref = reference.time(self.base_seconds);
        let mut results = [SyncResult::Failed(SyncFailure::NoSync {
            best_delta: f64::INFINITY,
            searched: None,
        }); NUM_CHANNELS - 1];
        for (slot, channel) in results.iter_mut().zip(companion_channels()) {
            let start = reference_index as i64 + self.offsets[channel];
            *slot = self.search_channel(source, channel, start, t_ref)?;
        }
        if results
            .iter()
            .all(|r| matches!(r, SyncResult::Aligned { .. }))
        {
            for (result, channel) in results.iter().zip(companion_channels()) {
                if let SyncResult::Aligned { index, .. } = result {
                    self.offsets[channel] = *index as i64 - reference_index as i64;
                    self.drift.record(channel, reference_index, *index);
                }
            }
        }
        Ok(results)
    }

    pub fn align_step<S: BlockSource>(
        &mut self,
        source: &mut S,
        reference_index: usize,
        reference: ChannelBlock,
    ) -> Result<Result<BlockSet, StepFailure>, DynError> {
        let results = self.align(source, reference_index, &reference)?;
        let t_ref = reference.time(self.base_seconds);
        let mut blocks = Vec::with_capacity(NUM_CHANNELS);
        let mut deltas = [0.0; NUM_CHANNELS];
        blocks.push(reference);
        for (result, channel) in results.iter().zip(companion_channels()) {
            match *result {
                SyncResult::Aligned { index, delta } => {
                    blocks.push(source.read_block(channel, index)?);
                    deltas[channel] = delta;
                }
                SyncResult::Failed(failure) => {
                    return Ok(Err(StepFailure {
                        channel,
                        reference_time: t_ref,
                        failure,
                    }));
                }
            }
        }
        debug!(
            "[sync] step {reference_index} t={t_ref:.6} deltas={:?}",
            &deltas[1..]
        );
        Ok(Ok(BlockSet { blocks, deltas }))
    }

    fn delta_at<S: BlockSource>(
        &self,
        source: &mut S,
        channel: usize,
        index: usize,
        t_ref: f64,
    ) -> Result<f64, DynError> {
        Ok(source.read_block(channel, index)?.time(self.base_seconds) - t_ref)
    }

    fn search_channel<S: BlockSource>(
        &self,
        source: &mut S,
        channel: usize,
        start: i64,
        t_ref: f64,
    ) -> Result<SyncResult, DynError> {
        let len = source.channel_len(channel);
        if len == 0 {
            return Ok(SyncResult::Failed(SyncFailure::SearchExhausted {
                steps: 0,
                best_delta: f64::INFINITY,
                searched: None,
            }));
        }
        let window = self.sync_window;
        let mut index = start.clamp(0, len as i64 - 1) as usize;
        let mut delta = self.delta_at(source, channel, index, t_ref)?;
        let (first_index, first_time) = (index, t_ref + delta);
        let span = |index: usize, delta: f64| {
            Some(SearchSpan {
                first_index,
                first_time,
                last_index: index,
                last_time: t_ref + delta,
            })
        };
        let mut best = delta.abs();
        let mut previous: Option<(usize, f64)> = None;
        let mut steps = 0usize;

        while delta > window {
            if steps >= self.max_steps || index == 0 {
                return Ok(SyncResult::Failed(SyncFailure::SearchExhausted {
                    steps,
                    best_delta: best,
                    searched: span(index, delta),
                }));
            }
            previous = Some((index, delta));
            index -= 1;
            steps += 1;
            delta = self.delta_at(source, channel, index, t_ref)?;
            best = best.min(delta.abs());
        }
        while delta < -window {
            if steps >= self.max_steps || index + 1 >= len {
                return Ok(SyncResult::Failed(SyncFailure::SearchExhausted {
                    steps,
                    best_delta: best,
                    searched: span(index, delta),
                }));
            }
            previous = Some((index, delta));
            index += 1;
            steps += 1;
            delta = self.delta_at(source, channel, index, t_ref)?;
            best = best.min(delta.abs());
        }
        let searched = span(index, delta);

        if let Some((prev_index, prev_delta)) = previous {
            if prev_delta.abs() < delta.abs() {
                index = prev_index;
                delta = prev_delta;
            }
        }

        if best > 2.0 * window {
            return Ok(SyncResult::Failed(SyncFailure::NoSync {
                best_delta: best,
                searched,
            }));
        }
        if delta.abs() > window {
            return Ok(SyncResult::Failed(SyncFailure::NoSync {
                best_delta: delta.abs(),
                searched,
            }));
        }
        Ok(SyncResult::Aligned { index, delta })
    }
}

fn companion_channels() -> impl Iterator<Item = usize> {
    (0..NUM_CHANNELS).filter(|&c| c != REFERENCE_CHANNEL)
}

fn describe_span(searched: &Option<SearchSpan>) -> String {
    match searched {
        Some(sp) => format!(
            "blocks {}..={} (t={:.6}..{:.6})",
            sp.first_index, sp.last_index, sp.first_time, sp.last_time
        ),
        None => "empty channel".to_string(),
    }
}

pub fn log_step_failure(reference_index: usize, f: &StepFailure) {
    match f.failure {
        SyncFailure::SearchExhausted {
            steps,
            best_delta,
            ref searched,
        } => warn!(
            "[sync] step {reference_index} (t={:.6}): {} search exhausted after {steps} steps over {}, best |dt|={best_delta:.6}",
            f.reference_time,
            CHANNEL_NAMES[f.channel],
            describe_span(searched)
        ),
        SyncFailure::NoSync {
            best_delta,
            ref searched,
        } => warn!(
            "[sync] step {reference_index} (t={:.6}): {} no sync over {}, best |dt|={best_delta:.6}",
            f.reference_time,
            CHANNEL_NAMES[f.channel],
            describe_span(searched)
        ),
    }
}

#[derive(Clone, Debug, Default)]
pub struct DriftTracker {
    spans: [Option<((usize, usize), (usize, usize))>; NUM_CHANNELS],
}

impl DriftTracker {
    fn record(&mut self, channel: usize, reference_index: usize, index: usize) {
        let point = (reference_index, index);
        let span = &mut self.spans[channel];
        match span {
            Some((_, last)) => *last = point,
            None => *span = Some((point, point)),
        }
    }

    pub fn ratio(&self, channel: usize) -> Option<f64> {
        let ((r0, c0), (r1, c1)) = self.spans.get(channel).copied().flatten()?;
        if r1 == r0 {
            return None;
        }
        Some((c1 as f64 - c0 as f64) / (r1 as f64 - r0 as f64))
    }

    pub fn merge_from(&mut self, other: &DriftTracker) {
        for (mine, theirs) in self.spans.iter_mut().zip(other.spans.iter()) {
            *mine = match (*mine, *theirs) {
                (Some((first, _)), Some((_, last))) => Some((first, last)),
                (None, t) => t,
                (m, None) => m,
            };
        }
    }

    pub fn log_summary(&self, precision: f64) {
        let fmt = RatioFormat::new(precision);
        for channel in companion_channels() {
            if let Some(ratio) = self.ratio(channel) {
                info!(
                    "[sync] {} advances {} blocks per reference block",
                    CHANNEL_NAMES[channel],
                    fmt.format(ratio)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::memory::{constant_block, MemorySource};

    const PERIOD: f64 = 0.524288;

    fn cfg() -> Config {
        Config::default()
    }

    // Reference at k*PERIOD, companions shifted by `delta`.
    fn shifted_source(blocks: usize, delta: f64) -> MemorySource {
        let channels = (0..NUM_CHANNELS)
            .map(|c| {
                let shift = if c == REFERENCE_CHANNEL { 0.0 } else { delta };
                (0..blocks)
                    .map(|k| constant_block(100.0 + k as f64 * PERIOD + shift, c as f32, 50.0))
                    .collect()
            })
            .collect();
        MemorySource::new(channels)
    }

    fn assert_all_aligned(results: &[SyncResult], index: usize, delta: f64) {
        for r in results {
            match *r {
                SyncResult::Aligned { index: i, delta: d } => {
                    assert_eq!(i, index);
                    assert!((d - delta).abs() < 1e-6, "delta {d} vs {delta}");
                }
                other => panic!("expected alignment, got {other:?}"),
            }
        }
    }

    #[test]
    fn constant_offset_within_window_aligns_in_place() {
        for &delta in &[0.0, 0.3, -0.7, 0.79] {
            let mut src = shifted_source(10, delta);
            let mut sync = Synchronizer::new(&cfg(), 100);
            let reference = src.read_block(0, 5).unwrap();
            let results = sync.align(&mut src, 5, &reference).unwrap();
            assert_all_aligned(&results, 5, delta);
        }
    }

    #[test]
    fn far_offset_at_channel_start_fails() {
        let mut src = shifted_source(10, 2.0 * 0.8 + 0.5);
        let mut sync = Synchronizer::new(&cfg(), 100);
        let reference = src.read_block(0, 0).unwrap();
        let results = sync.align(&mut src, 0, &reference).unwrap();
        for r in results.iter() {
            assert!(matches!(
                r,
                SyncResult::Failed(SyncFailure::SearchExhausted { .. })
            ));
        }
    }

    #[test]
    fn tight_budget_reports_exhaustion() {
        let mut c = cfg();
        c.sync_max_steps = 1;
        let mut src = shifted_source(20, 5.0 * PERIOD);
        let mut sync = Synchronizer::new(&c, 100);
        let reference = src.read_block(0, 10).unwrap();
        let results = sync.align(&mut src, 10, &reference).unwrap();
        assert!(matches!(
            results[0],
            SyncResult::Failed(SyncFailure::SearchExhausted { steps: 1, .. })
        ));
    }

    #[test]
    fn forward_search_stops_at_channel_end() {
        // Companions run 5 periods early, so block 19 is still 4 periods behind reference 18.
        let mut src = shifted_source(20, -5.0 * PERIOD);
        let mut sync = Synchronizer::new(&cfg(), 100);
        let reference = src.read_block(0, 18).unwrap();
        let results = sync.align(&mut src, 18, &reference).unwrap();
        for r in results.iter() {
            match *r {
                SyncResult::Failed(SyncFailure::SearchExhausted {
                    steps,
                    searched: Some(span),
                    ..
                }) => {
                    assert_eq!(steps, 1);
                    assert_eq!((span.first_index, span.last_index), (18, 19));
                }
                other => panic!("expected exhaustion at channel end, got {other:?}"),
            }
        }
    }

    #[test]
    fn forward_budget_reports_exhaustion() {
        let mut c = cfg();
        c.sync_max_steps = 1;
        let mut src = shifted_source(20, -5.0 * PERIOD);
        let mut sync = Synchronizer::new(&c, 100);
        let reference = src.read_block(0, 5).unwrap();
        let results = sync.align(&mut src, 5, &reference).unwrap();
        match results[3] {
            SyncResult::Failed(SyncFailure::SearchExhausted {
                steps: 1,
                best_delta,
                searched: Some(span),
            }) => {
                assert!((best_delta - 4.0 * PERIOD).abs() < 1e-6);
                assert_eq!(span.last_index, 6);
                assert!((span.last_time - PERIOD).abs() < 1e-6);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn gap_in_companion_is_no_sync() {
        let mut src = shifted_source(10, 0.0);
        // ixm has no block within 0.8 s of reference block 5.
        src.channels[1][4] = constant_block(100.0 + 5.0 * PERIOD - 1.5, 1.0, 50.0);
        src.channels[1][5] = constant_block(100.0 + 5.0 * PERIOD + 1.55, 1.0, 50.0);
        let mut sync = Synchronizer::new(&cfg(), 100);
        let reference = src.read_block(0, 5).unwrap();
        let results = sync.align(&mut src, 5, &reference).unwrap();
        assert!(matches!(results[0], SyncResult::Failed(SyncFailure::NoSync { .. })));
        assert!(matches!(results[1], SyncResult::Aligned { index: 5, .. }));
    }

    #[test]
    fn dropped_block_is_found_by_search_and_remembered() {
        // ixm lost its block 3, so from there its index runs one behind.
        let mut src = shifted_source(12, 0.0);
        src.channels[1].remove(3);
        let mut c = cfg();
        c.sync_window_s = 0.2;
        let mut sync = Synchronizer::new(&c, 100);

        let reference = src.read_block(0, 6).unwrap();
        let results = sync.align(&mut src, 6, &reference).unwrap();
        assert_eq!(results[0], SyncResult::Aligned { index: 5, delta: 0.0 });

        let reference = src.read_block(0, 7).unwrap();
        let results = sync.align(&mut src, 7, &reference).unwrap();
        assert!(matches!(results[0], SyncResult::Aligned { index: 6, .. }));
        assert_eq!(sync.drift().ratio(1), Some(1.0));
    }

    #[test]
    fn hysteresis_keeps_the_closer_block() {
        // Forward search lands on +0.75 after -0.9; the final block is closer.
        let mut src = shifted_source(10, 0.0);
        let t5 = 100.0 + 5.0 * PERIOD;
        src.channels[2][5] = constant_block(t5 - 0.9, 2.0, 50.0);
        src.channels[2][6] = constant_block(t5 + 0.75, 2.0, 50.0);
        let mut sync = Synchronizer::new(&cfg(), 100);
        let reference = src.read_block(0, 5).unwrap();
        let results = sync.align(&mut src, 5, &reference).unwrap();
        match results[1] {
            SyncResult::Aligned { index, delta } => {
                assert_eq!(index, 6);
                assert!((delta - 0.75).abs() < 1e-6);
            }
            other => panic!("{other:?}"),
        }

        let mut c = cfg();
        c.sync_window_s = 0.1;
        let mut src = shifted_source(10, 0.0);
        src.channels[2][5] = constant_block(t5 + 0.15, 2.0, 50.0);
        src.channels[2][4] = constant_block(t5 - 0.12, 2.0, 50.0);
        let mut sync = Synchronizer::new(&c, 100);
        let results = sync.align(&mut src, 5, &reference).unwrap();
        // The preceding -0.12 beats +0.15 but still lies outside the window, so the step is rejected.
        assert!(matches!(results[1], SyncResult::Failed(SyncFailure::NoSync { .. })));
    }

    #[test]
    fn align_step_returns_full_block_set() {
        let mut src = shifted_source(4, 0.25);
        let mut sync = Synchronizer::new(&cfg(), 100);
        let reference = src.read_block(0, 2).unwrap();
        let set = sync.align_step(&mut src, 2, reference).unwrap().unwrap();
        assert_eq!(set.blocks.len(), NUM_CHANNELS);
        assert_eq!(set.deltas[0], 0.0);
        for c in 1..NUM_CHANNELS {
            assert!((set.deltas[c] - 0.25).abs() < 1e-6);
            assert_eq!(set.blocks[c].samples()[0], c as f32);
        }
    }

    #[test]
    fn drift_merge_keeps_outer_points() {
        let mut a = DriftTracker::default();
        a.record(1, 0, 0);
        a.record(1, 10, 10);
        let mut b = DriftTracker::default();
        b.record(1, 20, 19);
        b.record(1, 50, 49);
        a.merge_from(&b);
        assert_eq!(a.ratio(1), Some(49.0 / 50.0));
        assert_eq!(a.ratio(2), None);
    }
}
