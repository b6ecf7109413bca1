use crate::block::{BlockSet, BLOCK_LEN, NUM_CHANNELS};

#[derive(Clone, Debug)]
pub struct BaselineTracker {
    values: [f64; NUM_CHANNELS],
    memory: f64,
    quiescent_threshold: f32,
    updates: u64,
}

impl BaselineTracker {
    pub fn new(memory: f64, quiescent_threshold: f32) -> Self {
        Self {
            values: [0.0; NUM_CHANNELS],
            memory: memory.max(1.0),
            quiescent_threshold,
            updates: 0,
        }
    }

    #[inline]
    pub fn values(&self) -> &[f64; NUM_CHANNELS] {
        &self.values
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn update(&mut self, reference_current: f32, channel_sums: &[f64; NUM_CHANNELS]) -> bool {
        if !(reference_current < self.quiescent_threshold) {
            return false;
        }
        let keep = (self.memory - 1.0) / self.memory;
        for (b, &sum) in self.values.iter_mut().zip(channel_sums.iter()) {
            let mean = sum / BLOCK_LEN as f64;
            *b = *b * keep + mean / self.memory;
        }
        self.updates += 1;
        true
    }

    pub fn update_from_blocks(&mut self, set: &BlockSet) -> bool {
        let mut sums = [0.0; NUM_CHANNELS];
        for (sum, block) in sums.iter_mut().zip(set.blocks.iter()) {
            *sum = block.sample_sum();
        }
        self.update(set.reference().current, &sums)
    }
}
