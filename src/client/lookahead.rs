//! Schedules metronome pulses a little ahead of real time.
//!
//! The scheduler turns the session's [`TimingState`] plus the current clock
//! offset into a [`PulseTimeline`]: the local instant of the next pulse and the
//! spacing of the ones after it.  Every pass hands the pulses falling inside
//! the look-ahead horizon to a [`PulseSink`].  Pulses whose instant is already
//! behind us are skipped without being emitted.
//!
//! All instants here are local milliseconds as `f64`.  Pulse `k` is the one at
//! authority time `epoch_start + k * ms_per_pulse`, and it is accented when
//! `k` is a multiple of the meter's pulses per measure.
use log::{debug, trace, warn};
use std::{
    sync::mpsc::{self, TryRecvError},
    time::Duration,
};

#[cfg(test)]
use mockall::automock;

use crate::common::{
    box_error::BoxError, get_micro_time, periodic_task::PeriodicTask, timing::TimingState,
};

/// local wall clock in fractional milliseconds
pub fn local_now_ms() -> f64 {
    get_micro_time() as f64 / 1000.0
}

/// One pulse handed to the sound side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulse {
    pub index: u64,
    /// local instant the pulse should sound
    pub at: f64,
    pub accent: bool,
}

/// Whatever makes the pulse audible.  Must not block.
#[cfg_attr(test, automock)]
pub trait PulseSink {
    fn emit(&mut self, pulse: Pulse) -> ();
}

/// Forwards pulses over a channel to the thread that renders them.
pub struct ChannelPulseSink {
    tx: mpsc::Sender<Pulse>,
}

impl ChannelPulseSink {
    pub fn new(tx: mpsc::Sender<Pulse>) -> ChannelPulseSink {
        ChannelPulseSink { tx }
    }
}

impl PulseSink for ChannelPulseSink {
    fn emit(&mut self, pulse: Pulse) -> () {
        if self.tx.send(pulse).is_err() {
            trace!("pulse {} dropped, nobody listening", pulse.index);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulseTimeline {
    /// local instant of pulse 0, trim included
    base: f64,
    ms_per_pulse: f64,
    pulses_per_measure: u32,
    next_index: u64,
}

impl PulseTimeline {
    /// Derive the phase from the epoch as seen at local time `now`.
    pub fn derive(timing: &TimingState, epoch_start: i64, offset: f64, trim: f64, now: f64) -> PulseTimeline {
        let ms_per_pulse = timing.ms_per_pulse();
        let authority_now = now + offset;
        let elapsed = (authority_now - epoch_start as f64).max(0.0);
        let pulse_index = (elapsed / ms_per_pulse).floor() as u64;
        PulseTimeline {
            base: epoch_start as f64 - offset + trim,
            ms_per_pulse,
            pulses_per_measure: timing.meter.pulses_per_measure().max(1),
            next_index: pulse_index + 1,
        }
    }

    /// index of the pulse the timeline was last at
    pub fn pulse_index(&self) -> u64 {
        self.next_index - 1
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// local instant of the next pulse
    pub fn next_at(&self) -> f64 {
        self.base + self.next_index as f64 * self.ms_per_pulse
    }

    pub fn ms_per_pulse(&self) -> f64 {
        self.ms_per_pulse
    }

    fn next_pulse(&self) -> Pulse {
        Pulse {
            index: self.next_index,
            at: self.next_at(),
            accent: self.next_index % self.pulses_per_measure as u64 == 0,
        }
    }

    fn advance(&mut self) -> () {
        self.next_index += 1;
    }

    fn shift(&mut self, delta: f64) -> () {
        self.base += delta;
    }
}

pub struct LookaheadScheduler {
    schedule_ahead: f64,
    trim: f64,
    timeline: Option<PulseTimeline>,
    sink: Box<dyn PulseSink + Send>,
}

impl LookaheadScheduler {
    pub fn new(
        schedule_ahead: Duration,
        trim: f64,
        sink: Box<dyn PulseSink + Send>,
    ) -> LookaheadScheduler {
        LookaheadScheduler {
            schedule_ahead: schedule_ahead.as_secs_f64() * 1000.0,
            trim,
            timeline: None,
            sink,
        }
    }

    pub fn timeline(&self) -> Option<&PulseTimeline> {
        self.timeline.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.timeline.is_some()
    }

    pub fn trim(&self) -> f64 {
        self.trim
    }

    /// Begin pulsing on `timing`'s grid.  A timing state that is not playing
    /// stops the scheduler instead.
    pub fn start(&mut self, timing: &TimingState, offset: f64, now: f64) -> () {
        match (timing.is_playing, timing.epoch_start) {
            (true, Some(epoch_start)) => {
                let timeline = PulseTimeline::derive(timing, epoch_start, offset, self.trim, now);
                debug!(
                    "scheduling from pulse {} at {:.1}, {:.1} ms apart",
                    timeline.next_index(),
                    timeline.next_at(),
                    timeline.ms_per_pulse()
                );
                self.timeline = Some(timeline);
            }
            _ => self.stop(),
        }
    }

    /// Tempo, meter or epoch changed.  Same derivation as a start.
    pub fn retime(&mut self, timing: &TimingState, offset: f64, now: f64) -> () {
        self.start(timing, offset, now);
    }

    pub fn stop(&mut self) -> () {
        if self.timeline.take().is_some() {
            debug!("scheduler stopped");
        }
    }

    /// Change the manual latency trim.  Only the next pulse moves, by the
    /// difference from the old trim; the spacing stays.
    pub fn set_trim(&mut self, trim: f64) -> () {
        let delta = trim - self.trim;
        self.trim = trim;
        if let Some(timeline) = self.timeline.as_mut() {
            timeline.shift(delta);
        }
    }

    /// One scheduling pass at local time `now`.  Returns how many pulses went
    /// to the sink.
    pub fn pass(&mut self, now: f64) -> usize {
        let timeline = match self.timeline.as_mut() {
            Some(t) => t,
            None => return 0,
        };
        let horizon = now + self.schedule_ahead;
        let mut emitted = 0;
        while timeline.next_at() < horizon {
            let pulse = timeline.next_pulse();
            if pulse.at >= now {
                self.sink.emit(pulse);
                emitted += 1;
            } else {
                trace!("pulse {} already passed", pulse.index);
            }
            timeline.advance();
        }
        emitted
    }

    pub fn apply(&mut self, cmd: SchedulerCommand, now: f64) -> () {
        match cmd {
            SchedulerCommand::Start { timing, offset } => self.start(&timing, offset, now),
            SchedulerCommand::Retime { timing, offset } => self.retime(&timing, offset, now),
            SchedulerCommand::Stop => self.stop(),
            SchedulerCommand::SetTrim(trim) => self.set_trim(trim),
        }
    }
}

/// Requests to the scheduler thread, the only owner of the timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCommand {
    Start { timing: TimingState, offset: f64 },
    Retime { timing: TimingState, offset: f64 },
    Stop,
    SetTrim(f64),
}

/// Run `scheduler` on its own periodic task.  The task ends when it is
/// cancelled or the returned sender is dropped.
pub fn spawn_scheduler(
    mut scheduler: LookaheadScheduler,
    period: Duration,
) -> Result<(PeriodicTask, mpsc::Sender<SchedulerCommand>), BoxError> {
    let (tx, rx) = mpsc::channel();
    let task = PeriodicTask::spawn("scheduler", period, move || {
        let now = local_now_ms();
        loop {
            match rx.try_recv() {
                Ok(cmd) => scheduler.apply(cmd, now),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("scheduler lost its command channel");
                    return false;
                }
            }
        }
        scheduler.pass(now);
        true
    })?;
    Ok((task, tx))
}
