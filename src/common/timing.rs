//! The shared tempo grid description.
//!
//! [`TimingState`] is what the authority keeps per session and what every
//! timing broadcast carries to the clients.  Instants are milliseconds on the
//! authority's clock.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const DEFAULT_BPM: u32 = 120;
pub const DEFAULT_METER: Meter = Meter {
    numerator: 4,
    denominator: 4,
};

const METER_PATTERN: &str = r"^(\d+)/(\d+)$";

static METER_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(METER_PATTERN).ok());

/// Time signature. The numerator is the number of pulses per measure.
///
/// On the wire a meter travels as its text form, `"7/8"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Meter {
    pub numerator: u32,
    pub denominator: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterParseError {
    text: String,
}

impl fmt::Display for MeterParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}' is not a valid meter", self.text)
    }
}

impl std::error::Error for MeterParseError {}

impl Meter {
    pub fn pulses_per_measure(&self) -> u32 {
        self.numerator
    }
}

impl FromStr for Meter {
    type Err = MeterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || MeterParseError {
            text: s.to_string(),
        };
        let re = METER_RE.as_ref().ok_or_else(bad)?;
        let caps = re.captures(s).ok_or_else(bad)?;
        // digits only, so the parse can only fail on overflow
        let numerator: u32 = caps[1].parse().map_err(|_| bad())?;
        let denominator: u32 = caps[2].parse().map_err(|_| bad())?;
        if numerator == 0 || denominator == 0 {
            return Err(bad());
        }
        Ok(Meter {
            numerator,
            denominator,
        })
    }
}

impl TryFrom<String> for Meter {
    type Error = MeterParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Meter> for String {
    fn from(m: Meter) -> String {
        m.to_string()
    }
}

impl fmt::Display for Meter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Playback state of a session's tempo grid.
///
/// `epoch_start` is the authority instant of pulse 0.  It is `None` whenever
/// `is_playing` is false and must be ignored in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingState {
    pub is_playing: bool,
    pub bpm: u32,
    pub meter: Meter,
    pub epoch_start: Option<i64>,
}

impl Default for TimingState {
    fn default() -> Self {
        TimingState {
            is_playing: false,
            bpm: DEFAULT_BPM,
            meter: DEFAULT_METER,
            epoch_start: None,
        }
    }
}

impl TimingState {
    /// length of one pulse in milliseconds
    pub fn ms_per_pulse(&self) -> f64 {
        ms_per_pulse(self.bpm)
    }
}

pub fn ms_per_pulse(bpm: u32) -> f64 {
    60_000.0 / bpm as f64
}

impl fmt::Display for TimingState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ playing: {}, bpm: {}, meter: {}, epoch: {:?} }}",
            self.is_playing, self.bpm, self.meter, self.epoch_start
        )
    }
}

#[cfg(test)]
mod test_timing {
    use super::*;

    #[test]
    fn parse_meter() {
        let m: Meter = "7/8".parse().unwrap();
        assert_eq!(m.numerator, 7);
        assert_eq!(m.denominator, 8);
        assert_eq!(m.pulses_per_measure(), 7);
        assert_eq!(m.to_string(), "7/8");
    }

    #[test]
    fn reject_bad_meters() {
        for bad in ["", "4", "4/", "/4", "a/4", "4/4/4", " 4/4", "0/4", "4/0", "-3/4", "4.5/4"] {
            assert!(bad.parse::<Meter>().is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn ms_per_pulse_at_120() {
        let timing = TimingState::default();
        assert_eq!(timing.ms_per_pulse(), 500.0);
    }

    #[test]
    fn timing_json_shape() {
        let timing = TimingState {
            is_playing: true,
            bpm: 96,
            meter: "3/4".parse().unwrap(),
            epoch_start: Some(1_700_000_000_123),
        };
        let v = serde_json::to_value(&timing).unwrap();
        assert_eq!(v["isPlaying"], true);
        assert_eq!(v["bpm"], 96);
        assert_eq!(v["meter"], "3/4");
        assert_eq!(v["epochStart"], 1_700_000_000_123i64);
        let back: TimingState = serde_json::from_value(v).unwrap();
        assert_eq!(back, timing);
    }

    #[test]
    fn stopped_timing_has_null_epoch() {
        let v = serde_json::to_value(TimingState::default()).unwrap();
        assert!(v["epochStart"].is_null());
        assert_eq!(v["meter"], "4/4");
    }

    #[test]
    fn bad_meter_fails_to_deserialize() {
        let raw = r#"{"isPlaying":false,"bpm":120,"meter":"four","epochStart":null}"#;
        assert!(serde_json::from_str::<TimingState>(raw).is_err());
    }
}
