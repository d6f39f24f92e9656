//! Running statistics over a stream of samples.
//!
//! [`StreamTimeStat`] characterizes round trip times on the clock sync
//! exchange.
use std::f64;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamTimeStat {
    peak: f64,
    mean: f64,
    sigma: f64,
    window: u64,
    samples: u64,
}

impl StreamTimeStat {
    pub fn new(window_size: u64) -> StreamTimeStat {
        StreamTimeStat {
            peak: 0.0,
            mean: 0.0,
            sigma: 0.0,
            window: window_size.max(1),
            samples: 0,
        }
    }
    pub fn clear(&mut self) -> () {
        self.peak = 0.0;
        self.mean = 0.0;
        self.sigma = 0.0;
        self.samples = 0;
    }
    pub fn get_peak(&self) -> f64 {
        self.peak
    }
    pub fn get_mean(&self) -> f64 {
        self.mean
    }
    pub fn get_sigma(&self) -> f64 {
        self.sigma
    }
    pub fn get_samples(&self) -> u64 {
        self.samples
    }

    /// Fold a sample into the stats.
    ///
    /// The first sample seeds the mean so a short run of samples is not
    /// dragged toward zero.  After that the mean is an exponential average over
    /// the window.
    pub fn add_sample(&mut self, sample: f64) -> () {
        self.peak = self.peak.max(sample);
        if self.samples == 0 {
            self.mean = sample;
        } else {
            let n = self.window.min(self.samples + 1) as f64;
            self.mean += (sample - self.mean) / n;
            self.sigma += ((self.mean - sample).abs() - self.sigma) / n;
        }
        self.samples += 1;
    }
}

impl fmt::Display for StreamTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ peak: {:.1}, mean: {:.1}, sigma: {:.1} samples: {} }}",
            self.peak, self.mean, self.sigma, self.samples
        )
    }
}

#[cfg(test)]
mod test_stream_time_stat {
    use super::*;

    #[test]
    fn build() {
        let stat = StreamTimeStat::new(100);
        assert_eq!(stat.get_mean(), 0.0);
        assert_eq!(stat.get_samples(), 0);
    }
    #[test]
    fn first_sample_seeds_mean() {
        let mut stat = StreamTimeStat::new(8);
        stat.add_sample(40.0);
        assert_eq!(stat.get_mean(), 40.0);
        assert_eq!(stat.get_peak(), 40.0);
    }
    #[test]
    fn add_sample() {
        let mut stat = StreamTimeStat::new(4);
        stat.add_sample(40.0);
        stat.add_sample(80.0);
        assert_eq!(stat.get_mean(), 60.0);
        assert_eq!(stat.get_peak(), 80.0);
        assert!(stat.get_sigma() > 0.0);
        stat.clear();
        assert_eq!(stat.get_samples(), 0);
    }
}
