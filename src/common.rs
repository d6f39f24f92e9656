//! These modules are shared among both the client and server halves of beatsync.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod box_error;
pub mod config;
pub mod event_message;
pub mod periodic_task;
pub mod stream_time_stat;
pub mod timing;
pub mod websocket;

/// microseconds since the unix epoch
pub fn get_micro_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros()
}

/// milliseconds since the unix epoch.  This is the unit of every instant on the wire.
pub fn get_milli_time() -> i64 {
    (get_micro_time() / 1000) as i64
}

#[cfg(test)]
mod test_common {
    use super::*;

    #[test]
    fn clocks_agree() {
        let micro = get_micro_time();
        let milli = get_milli_time();
        assert!(milli >= (micro / 1000) as i64);
        assert!(milli - ((micro / 1000) as i64) < 1000);
    }
}
