use std::collections::VecDeque;

/// Most samples kept for one session; at one sample every 10 s this covers
/// the last ~16 minutes of a run.
pub const CAPACITY: usize = 100;

/// Rolling window of valid temperature samples taken while the motors run.
///
/// Only readings that passed range validation are pushed, so the mean never
/// sees a missing or bogus value. When full, the oldest sample is dropped.
#[derive(Debug, Clone, Default)]
pub struct TemperatureBuffer {
    samples: VecDeque<f64>,
}

impl TemperatureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, celsius: f64) {
        if self.samples.len() == CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(celsius);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Arithmetic mean of the buffered samples; `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}
