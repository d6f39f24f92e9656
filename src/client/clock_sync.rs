//! Estimate of how far the local clock is from the authority's clock.
//!
//! One request/response exchange gives one sample.  The newest sample always
//! wins.  Round trip times are kept in a [`StreamTimeStat`] for the logs only.
use log::{debug, trace};

use crate::common::{event_message::ClientEvent, stream_time_stat::StreamTimeStat};

const RTT_WINDOW: u64 = 20;

pub struct ClockSyncEstimator {
    offset: f64,
    samples: u64,
    rtt: StreamTimeStat,
}

impl ClockSyncEstimator {
    pub fn new() -> ClockSyncEstimator {
        ClockSyncEstimator {
            offset: 0.0,
            samples: 0,
            rtt: StreamTimeStat::new(RTT_WINDOW),
        }
    }

    /// The request to send at local time `now`.
    pub fn request(now: i64) -> ClientEvent {
        ClientEvent::SyncRequest { client_time: now }
    }

    /// Fold in a response received at local time `now`.
    ///
    /// Returns the new offset, or `None` when the response was discarded
    /// because it echoes a time later than `now`.
    pub fn on_response(&mut self, client_time: i64, authority_time: i64, now: i64) -> Option<f64> {
        let rtt = now - client_time;
        if rtt < 0 {
            debug!("sync response from the future: sent {} now {}", client_time, now);
            return None;
        }
        let rtt = rtt as f64;
        self.offset = authority_time as f64 + rtt / 2.0 - now as f64;
        self.samples += 1;
        self.rtt.add_sample(rtt);
        trace!("offset {:.1} ms rtt {}", self.offset, self.rtt);
        Some(self.offset)
    }

    /// milliseconds to add to a local instant to get the authority instant
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn has_sample(&self) -> bool {
        self.samples > 0
    }

    pub fn rtt_stats(&self) -> &StreamTimeStat {
        &self.rtt
    }

    /// Forget everything, as after a reconnect.
    pub fn reset(&mut self) -> () {
        self.offset = 0.0;
        self.samples = 0;
        self.rtt.clear();
    }
}

impl Default for ClockSyncEstimator {
    fn default() -> Self {
        Self::new()
    }
}
