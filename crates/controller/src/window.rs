use std::collections::VecDeque;

/// Fixed-capacity FIFO of recent vehicle totals.
#[derive(Clone, Debug)]
pub struct DensityWindow {
    samples: VecDeque<u32>,
    capacity: usize,
}

impl DensityWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, total_vehicles: u32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(total_vehicles);
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.samples.iter().map(|&v| u64::from(v)).sum();
        sum as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
