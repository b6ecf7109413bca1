use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub struct RatioFormat {
    pub min_denominator: u64,
    /// Largest denominator tried is `ceil(1 / precision)`.
    pub precision: f64,
    pub tolerance: f64,
}

impl RatioFormat {
    pub fn new(precision: f64) -> Self {
        Self {
            min_denominator: 1,
            precision,
            tolerance: 1e-6,
        }
    }

    fn max_denominator(&self) -> u64 {
        if self.precision > 0.0 && self.precision.is_finite() {
            (1.0 / self.precision).ceil() as u64
        } else {
            self.min_denominator
        }
    }

    pub fn approximate(&self, value: f64) -> Option<(i64, u64)> {
        if !value.is_finite() {
            return None;
        }
        let lo = self.min_denominator.max(1);
        for den in lo..=self.max_denominator().max(lo) {
            let num = (value * den as f64).round();
            if (num / den as f64 - value).abs() <= self.tolerance {
                return Some((num as i64, den));
            }
        }
        None
    }

    pub fn format(&self, value: f64) -> String {
        match self.approximate(value) {
            Some((num, den)) => format!("{num}/{den}"),
            None => {
                warn!(
                    "[sync] no fraction with denominator <= {} matches {value:.9}; using decimal",
                    self.max_denominator()
                );
                format!("{value:.6}")
            }
        }
    }
}
