//! A named thread that runs a closure on a fixed period until cancelled.
//!
//! The task owns a stop channel.  Cancelling (or dropping the task) closes the
//! channel, which wakes the thread immediately instead of waiting for the next
//! period, and then joins it.  The closure may also end the task by returning
//! `false`.
use log::{debug, error};
use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::common::box_error::BoxError;

pub struct PeriodicTask {
    name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start the task.  `tick` runs once right away and then every `period`.
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Result<PeriodicTask, BoxError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("{} - started", thread_name);
                while tick() {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // either an explicit stop or the owner went away
                        _ => break,
                    }
                }
                debug!("{} - stopped", thread_name);
            })?;
        Ok(PeriodicTask {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        match &self.handle {
            Some(h) => !h.is_finished(),
            None => false,
        }
    }

    /// Stop the task and wait for its thread to exit.
    pub fn cancel(&mut self) -> () {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // cancelled from inside its own tick, the loop exits on return
                return;
            }
            if handle.join().is_err() {
                error!("{} - task panicked", self.name);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
