//! the metronome client: clock sync, pulse scheduling, the server link and the
//! runtime tying them together
pub mod clock_sync;
pub mod lookahead;
pub mod metronome_client;
pub mod session_link;
