//! Error type used for plumbing between threads.
//!
//! Anything that crosses a thread boundary (link threads, the authority
//! thread, the periodic tasks) reports failure through this so it can be
//! moved freely.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
