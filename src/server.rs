//! the session server: sessions, their rules, the wire protocol and the runtime
pub mod protocol_adapter;
pub mod session_authority;
pub mod session_error;
pub mod session_store;
pub mod sync_server;
