use crate::utils::DynError;

pub const BLOCK_LEN: usize = 8192;
pub const NUM_CHANNELS: usize = 8;
pub const REFERENCE_CHANNEL: usize = 0;

pub const CHANNEL_NAMES: [&str; NUM_CHANNELS] =
    ["ixp", "ixm", "iyp", "iym", "oxp", "oxm", "oyp", "oym"];

pub const CHANNEL_TREES: [&str; NUM_CHANNELS] = [
    "N9:raw_XP",
    "N9:raw_XM",
    "N9:raw_YP",
    "N9:raw_YM",
    "N10:raw_XP",
    "N10:raw_XM",
    "N10:raw_YP",
    "N10:raw_YM",
];

pub fn channel_index(name: &str) -> Option<usize> {
    CHANNEL_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name.trim()))
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelBlock {
    pub seconds: i64,
    pub nanoseconds: i64,
    samples: Vec<f32>,
    pub current: f32,
    pub gain: i16,
}

impl ChannelBlock {
    pub fn new(
        seconds: i64,
        nanoseconds: i64,
        samples: Vec<f32>,
        current: f32,
        gain: i16,
    ) -> Result<Self, DynError> {
        if samples.len() != BLOCK_LEN {
            return Err(format!(
                "block must hold exactly {BLOCK_LEN} samples, got {}",
                samples.len()
            )
            .into());
        }
        Ok(Self {
            seconds,
            nanoseconds,
            samples,
            current,
            gain,
        })
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[inline]
    pub fn time(&self, base_seconds: i64) -> f64 {
        (self.seconds - base_seconds) as f64 + self.nanoseconds as f64 * 1e-9
    }

    pub fn sample_sum(&self) -> f64 {
        self.samples.iter().map(|&x| x as f64).sum()
    }

    pub fn gain_scale(&self) -> f32 {
        10f64.powi(6 + self.gain as i32) as f32
    }
}

pub trait BlockSource {
    fn channel_len(&self, channel: usize) -> usize;
    fn read_block(&mut self, channel: usize, index: usize) -> Result<ChannelBlock, DynError>;
}

#[derive(Clone, Debug)]
pub struct BlockSet {
    pub blocks: Vec<ChannelBlock>,
    /// `t_c - t_ref` for each channel; zero for the reference.
    pub deltas: [f64; NUM_CHANNELS],
}

impl BlockSet {
    pub fn reference(&self) -> &ChannelBlock {
        &self.blocks[REFERENCE_CHANNEL]
    }
}
