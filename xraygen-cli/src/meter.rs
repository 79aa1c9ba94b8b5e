/// Running average of a batch statistic, weighted by how many items each
/// batch scored.
#[derive(Debug, Default)]
pub struct Meter {
    value: f64,
    sum: f64,
    count: usize,
}

impl Meter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.value = value;
        self.sum += value * n as f64;
        self.count += n;
    }

    /// The most recently recorded value.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as f64
        }
    }
}
