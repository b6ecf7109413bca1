use std::collections::VecDeque;
use std::path::Path;

use tracing::{info, warn};

use crate::block::CHANNEL_NAMES;
use crate::emitter::MergedSample;
use crate::output::MergedRecordReader;
use crate::plot::plot_transit_window;
use crate::utils::DynError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    pub fn label(&self) -> &'static str {
        match self {
            Edge::Rising => "rising",
            Edge::Falling => "falling",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransitConfig {
    pub channel: usize,
    pub threshold: f32,
    pub lookback_s: f64,
    pub record_len: usize,
    pub post_samples: usize,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            threshold: 200.0,
            lookback_s: 0.3,
            record_len: 500,
            post_samples: 200,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Transit {
    pub time: f64,
    pub edge: Edge,
    pub window: Vec<MergedSample>,
}

pub struct TransitScanner {
    cfg: TransitConfig,
    memory: VecDeque<(f64, f32)>,
    history: VecDeque<MergedSample>,
    pending: Option<(f64, usize)>,
}

impl TransitScanner {
    pub fn new(cfg: TransitConfig) -> Self {
        let cap = cfg.record_len.max(1);
        Self {
            memory: VecDeque::with_capacity(cap),
            history: VecDeque::with_capacity(cap),
            pending: None,
            cfg: TransitConfig {
                record_len: cap,
                ..cfg
            },
        }
    }

    fn snapshot(&self, time: f64, edge: Edge) -> Transit {
        Transit {
            time,
            edge,
            window: self.history.iter().copied().collect(),
        }
    }

    pub fn push(&mut self, sample: &MergedSample) -> Option<Transit> {
        if self.history.len() == self.cfg.record_len {
            self.history.pop_front();
        }
        self.history.push_back(*sample);

        let mut done = None;
        if let Some((time, remaining)) = self.pending.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                let time = *time;
                self.pending = None;
                done = Some(self.snapshot(time, Edge::Rising));
            }
        }

        let value = sample.channels[self.cfg.channel];
        let mut edge = None;
        if self.memory.len() == self.cfg.record_len {
            if let Some((t_old, v_old)) = self.memory.pop_front() {
                if sample.timestamp - t_old < self.cfg.lookback_s {
                    let drop = v_old - value;
                    if drop > self.cfg.threshold {
                        edge = Some(Edge::Falling);
                    } else if drop < -self.cfg.threshold {
                        edge = Some(Edge::Rising);
                    }
                }
            }
        }
        self.memory.push_back((sample.timestamp, value));

        match edge {
            Some(Edge::Falling) => {
                self.memory.clear();
                info!(
                    "[transit] {} falling edge at t={:.6}",
                    CHANNEL_NAMES[self.cfg.channel], sample.timestamp
                );
                done.or_else(|| Some(self.snapshot(sample.timestamp, Edge::Falling)))
            }
            Some(Edge::Rising) => {
                self.memory.clear();
                info!(
                    "[transit] {} rising edge at t={:.6}",
                    CHANNEL_NAMES[self.cfg.channel], sample.timestamp
                );
                if self.cfg.post_samples == 0 {
                    return done.or_else(|| Some(self.snapshot(sample.timestamp, Edge::Rising)));
                }
                self.pending = Some((sample.timestamp, self.cfg.post_samples));
                done
            }
            None => done,
        }
    }

    pub fn finish(&mut self) -> Option<Transit> {
        let (time, _) = self.pending.take()?;
        Some(self.snapshot(time, Edge::Rising))
    }
}

pub fn scan_merged_file(
    path: &Path,
    cfg: TransitConfig,
    out_dir: &Path,
    prefix: &str,
    max_plots: usize,
) -> Result<Vec<(f64, Edge)>, DynError> {
    let mut reader = MergedRecordReader::open(path)?;
    info!(
        "[transit] scanning {} ({} rows, {} watched)",
        path.display(),
        reader.header().rows,
        CHANNEL_NAMES[cfg.channel]
    );
    let mut scanner = TransitScanner::new(cfg);
    let mut found = Vec::new();
    let handle = |t: Transit, found: &mut Vec<(f64, Edge)>| {
        let n = found.len();
        found.push((t.time, t.edge));
        if n < max_plots {
            let file = out_dir.join(format!("{prefix}transit_{n:03}_{}.png", t.edge.label()));
            let title = format!("{} edge at t={:.3} s", t.edge.label(), t.time);
            match file.to_str() {
                Some(name) => {
                    if let Err(e) = plot_transit_window(&t.window, &title, name) {
                        warn!("[plot] transit window {n} not written: {e}");
                    }
                }
                None => warn!("[plot] non UTF-8 output path {}", file.display()),
            }
        }
    };
    while let Some(row) = reader.next_row()? {
        if let Some(t) = scanner.push(&row) {
            handle(t, &mut found);
        }
    }
    if let Some(t) = scanner.finish() {
        handle(t, &mut found);
    }
    Ok(found)
}
