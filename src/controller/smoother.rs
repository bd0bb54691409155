/// Filter parameters for the grid power estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmootherSettings {
    pub consume_factor: f64,
    pub feed_in_factor: f64,
    pub big_change_w: f64,
    pub accuracy_w: f64,
    pub zero_point_w: f64,
    pub failure_sentinel_w: f64,
}

impl Default for SmootherSettings {
    fn default() -> Self {
        Self {
            consume_factor: 4.0,
            feed_in_factor: 1.0,
            big_change_w: 100.0,
            accuracy_w: 10.0,
            zero_point_w: 50.0,
            failure_sentinel_w: -100.0,
        }
    }
}

/// Asymmetric exponential filter over raw grid meter samples.
///
/// Feed-in and large jumps are followed quickly, rising consumption slowly.
#[derive(Debug, Clone)]
pub struct GridSmoother {
    settings: SmootherSettings,
    filtered_w: f64,
}

impl GridSmoother {
    pub fn new(settings: SmootherSettings) -> Self {
        Self {
            settings,
            filtered_w: 0.0,
        }
    }

    pub fn value(&self) -> f64 {
        self.filtered_w
    }

    pub fn update(&mut self, raw_w: f64, charge_limited: bool) -> f64 {
        let s = &self.settings;
        let (factor, bias) = if charge_limited {
            // shift the working point towards export while the battery is full
            (s.feed_in_factor, 2.0 * s.zero_point_w)
        } else if raw_w < -s.accuracy_w || (self.filtered_w - raw_w).abs() > s.big_change_w {
            (s.feed_in_factor, 0.0)
        } else {
            (s.consume_factor, 0.0)
        };
        self.filtered_w = (self.filtered_w * factor + raw_w + bias) / (factor + 1.0);
        self.filtered_w
    }

    /// Meter unreadable: assume export so the inverters back off.
    pub fn fail(&mut self) -> f64 {
        self.filtered_w = self.settings.failure_sentinel_w;
        self.filtered_w
    }

    /// Replace the estimate with the grid power expected after a correction.
    pub fn assume(&mut self, value_w: f64) {
        self.filtered_w = value_w;
    }
}
