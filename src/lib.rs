//! beatsync - shared metronome sessions
//!
//! provides library elements to run a session server, which keeps the tempo
//! grid of every session, and metronome clients, which sync their clock to the
//! server and sound every pulse of that grid at the same instant.
pub mod client;
pub mod common;
pub mod server;
