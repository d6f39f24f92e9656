//! top level entry point called by main to run a metronome client
//!
//! The client keeps its own view of the session it is in, built from the
//! events the server sends.  While it is in a session two periodic tasks run:
//! the clock sync task, which only sends sync requests, and the scheduler
//! task, which owns the [`LookaheadScheduler`].  Both are torn down together
//! when the session is left or the link drops.
//!
//! Everything else happens on the thread calling [`run`]: link events and user
//! commands are handled in arrival order.
use log::{debug, info, warn};
use simple_error::bail;
use std::{
    fmt,
    sync::mpsc::{self, RecvTimeoutError, TryRecvError},
    time::Duration,
};

use crate::common::{
    box_error::BoxError,
    config::ClientSettings,
    event_message::{ClientEvent, ConnectionId, Member, ServerEvent, SessionSnapshot},
    get_milli_time,
    periodic_task::PeriodicTask,
    timing::TimingState,
};

use super::{
    clock_sync::ClockSyncEstimator,
    lookahead::{spawn_scheduler, ChannelPulseSink, LookaheadScheduler, Pulse, SchedulerCommand},
    session_link::{LinkEvent, SessionLink},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(20);

/// Something the person at the client asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Create { name: String },
    Join { code: String, name: String },
    Leave,
    Start,
    Stop,
    Tempo(i64),
    Meter(String),
    Trim(f64),
}

impl UserCommand {
    /// Parse a command line such as `join ab12cd Grace` or `tempo 90`.
    pub fn parse(line: &str) -> Result<UserCommand, BoxError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let cmd = match words.as_slice() {
            ["create", name @ ..] if !name.is_empty() => UserCommand::Create {
                name: name.join(" "),
            },
            ["join", code, name @ ..] if !name.is_empty() => UserCommand::Join {
                code: code.to_string(),
                name: name.join(" "),
            },
            ["leave"] => UserCommand::Leave,
            ["start"] => UserCommand::Start,
            ["stop"] => UserCommand::Stop,
            ["tempo", bpm] => UserCommand::Tempo(bpm.parse()?),
            ["meter", meter] => UserCommand::Meter(meter.to_string()),
            ["trim", ms] => UserCommand::Trim(ms.parse()?),
            _ => bail!("unknown command '{}'", line.trim()),
        };
        Ok(cmd)
    }
}

/// The client's picture of its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub code: String,
    pub id: String,
    pub is_host: bool,
    /// our own connection, as far as we can tell from the snapshot
    pub me: Option<ConnectionId>,
    pub members: Vec<Member>,
    pub timing: TimingState,
}

impl SessionView {
    /// Build the view from a create or join answer.
    ///
    /// The snapshot does not say which member we are.  A creator is alone and a
    /// joiner is the newest member, except on a repeated join of the session we
    /// are already in, where someone may have joined after us.  `known_me` is
    /// our connection from the current view in that case and wins when it is
    /// still listed.
    fn from_snapshot(
        snap: SessionSnapshot,
        created: bool,
        known_me: Option<ConnectionId>,
    ) -> SessionView {
        let still_listed =
            known_me.filter(|me| snap.members.iter().any(|m| m.connection_id == *me));
        let me = if still_listed.is_some() {
            still_listed
        } else if created {
            snap.members.first().map(|m| m.connection_id)
        } else {
            snap.members
                .iter()
                .max_by_key(|m| (m.joined_at, m.connection_id))
                .map(|m| m.connection_id)
        };
        SessionView {
            code: snap.code,
            id: snap.id,
            is_host: snap.is_host,
            me,
            members: snap.members,
            timing: snap.timing,
        }
    }

    fn add_member(&mut self, member: Member) -> () {
        if !self.members.iter().any(|m| m.connection_id == member.connection_id) {
            self.members.push(member);
        }
    }

    /// Drop a member.  When it was the host, the earliest remaining joiner
    /// takes over, the same way the server picks.
    fn remove_member(&mut self, conn: ConnectionId) -> () {
        let was_host = self
            .members
            .iter()
            .any(|m| m.connection_id == conn && m.is_host);
        self.members.retain(|m| m.connection_id != conn);
        if !was_host {
            return;
        }
        let next = self
            .members
            .iter()
            .min_by_key(|m| (m.joined_at, m.connection_id))
            .map(|m| m.connection_id);
        for m in self.members.iter_mut() {
            m.is_host = Some(m.connection_id) == next;
        }
        self.is_host = next.is_some() && next == self.me;
    }
}

impl fmt::Display for SessionView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "session {} ({}), {} members, timing {}",
            self.code,
            if self.is_host { "host" } else { "guest" },
            self.members.len(),
            self.timing
        )
    }
}

struct ClientTasks {
    // field order is drop order, the sender goes before the task joins
    sched_tx: mpsc::Sender<SchedulerCommand>,
    _scheduler: PeriodicTask,
    _sync: PeriodicTask,
}

pub struct MetronomeClient {
    settings: ClientSettings,
    link_tx: mpsc::Sender<ClientEvent>,
    pulse_tx: mpsc::Sender<Pulse>,
    clock: ClockSyncEstimator,
    trim: f64,
    connected: bool,
    view: Option<SessionView>,
    last_error: Option<String>,
    tasks: Option<ClientTasks>,
}

impl MetronomeClient {
    pub fn new(
        settings: ClientSettings,
        link_tx: mpsc::Sender<ClientEvent>,
        pulse_tx: mpsc::Sender<Pulse>,
    ) -> MetronomeClient {
        let trim = settings.manual_trim_ms;
        MetronomeClient {
            settings,
            link_tx,
            pulse_tx,
            clock: ClockSyncEstimator::new(),
            trim,
            connected: false,
            view: None,
            last_error: None,
            tasks: None,
        }
    }

    pub fn view(&self) -> Option<&SessionView> {
        self.view.as_ref()
    }

    pub fn offset(&self) -> f64 {
        self.clock.offset()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn tasks_running(&self) -> bool {
        self.tasks.is_some()
    }

    /// Handle one report from the link at local time `now`.
    pub fn handle_link(&mut self, event: LinkEvent, now: i64) -> Result<(), BoxError> {
        match event {
            LinkEvent::Connected => {
                info!("connected to {}", self.settings.server_url);
                self.connected = true;
                self.clock.reset();
            }
            LinkEvent::Disconnected => {
                warn!("lost the server");
                self.connected = false;
                self.leave_view();
            }
            LinkEvent::Event(event) => self.handle_event(event, now)?,
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: ServerEvent, now: i64) -> Result<(), BoxError> {
        debug!("event: {}", event);
        match event {
            ServerEvent::SessionCreated(snap) => self.enter_view(snap, true)?,
            ServerEvent::SessionJoined(snap) => self.enter_view(snap, false)?,
            ServerEvent::MemberJoined { member } => {
                if let Some(view) = self.view.as_mut() {
                    info!("{} joined", member.name);
                    view.add_member(member);
                }
            }
            ServerEvent::MemberLeft { connection_id } => {
                if let Some(view) = self.view.as_mut() {
                    view.remove_member(connection_id);
                    if view.is_host {
                        info!("we are the host now");
                    }
                }
            }
            ServerEvent::SessionLeft {} => {
                info!("left the session");
                self.leave_view();
            }
            ServerEvent::TimingStarted {
                epoch_start,
                bpm,
                meter,
            } => {
                let timing = TimingState {
                    is_playing: true,
                    bpm,
                    meter,
                    epoch_start: Some(epoch_start),
                };
                self.update_timing(timing, true);
            }
            ServerEvent::TimingStopped {} => {
                let timing = match self.view.as_ref() {
                    Some(v) => TimingState {
                        is_playing: false,
                        epoch_start: None,
                        ..v.timing.clone()
                    },
                    None => TimingState::default(),
                };
                self.update_timing(timing, false);
            }
            ServerEvent::TimingUpdated(timing) => self.update_timing(timing, false),
            ServerEvent::SyncResponse {
                client_time,
                authority_time,
            } => {
                let first = !self.clock.has_sample();
                if self.clock.on_response(client_time, authority_time, now).is_some() && first {
                    // the grid was laid out before we knew the offset
                    if let Some(timing) = self.playing_timing() {
                        self.schedule(SchedulerCommand::Retime {
                            timing,
                            offset: self.clock.offset(),
                        });
                    }
                }
            }
            ServerEvent::SessionError { message } => {
                warn!("server says: {}", message);
                self.last_error = Some(message);
            }
        }
        Ok(())
    }

    pub fn handle_user(&mut self, cmd: UserCommand) -> Result<(), BoxError> {
        let event = match cmd {
            UserCommand::Trim(trim) => {
                self.trim = trim;
                self.schedule(SchedulerCommand::SetTrim(trim));
                return Ok(());
            }
            UserCommand::Create { name } => ClientEvent::CreateSession { name },
            UserCommand::Join { code, name } => ClientEvent::JoinSession { code, name },
            UserCommand::Leave => ClientEvent::LeaveSession,
            UserCommand::Start => ClientEvent::StartTiming,
            UserCommand::Stop => ClientEvent::StopTiming,
            UserCommand::Tempo(bpm) => ClientEvent::SetTempo { bpm },
            UserCommand::Meter(meter) => ClientEvent::SetMeter { meter },
        };
        self.last_error = None;
        self.link_tx.send(event)?;
        Ok(())
    }

    fn playing_timing(&self) -> Option<TimingState> {
        self.view
            .as_ref()
            .filter(|v| v.timing.is_playing)
            .map(|v| v.timing.clone())
    }

    fn enter_view(&mut self, snap: SessionSnapshot, created: bool) -> Result<(), BoxError> {
        // a new snapshot replaces whatever session we were in
        self.tasks = None;
        let known_me = match self.view.as_ref() {
            Some(v) if !created && v.code == snap.code => v.me,
            _ => None,
        };
        let view = SessionView::from_snapshot(snap, created, known_me);
        info!("in {}", view);
        self.view = Some(view);
        self.start_tasks()?;
        if let Some(timing) = self.playing_timing() {
            self.schedule(SchedulerCommand::Start {
                timing,
                offset: self.clock.offset(),
            });
        }
        Ok(())
    }

    fn leave_view(&mut self) -> () {
        if self.tasks.take().is_some() {
            debug!("client tasks stopped");
        }
        self.view = None;
    }

    fn update_timing(&mut self, timing: TimingState, started: bool) -> () {
        let view = match self.view.as_mut() {
            Some(v) => v,
            None => return,
        };
        view.timing = timing.clone();
        info!("timing {}", timing);
        let offset = self.clock.offset();
        let cmd = match (timing.is_playing, started) {
            (false, _) => SchedulerCommand::Stop,
            (true, true) => SchedulerCommand::Start { timing, offset },
            (true, false) => SchedulerCommand::Retime { timing, offset },
        };
        self.schedule(cmd);
    }

    fn schedule(&self, cmd: SchedulerCommand) -> () {
        if let Some(tasks) = &self.tasks {
            if tasks.sched_tx.send(cmd).is_err() {
                warn!("scheduler is gone");
            }
        }
    }

    fn start_tasks(&mut self) -> Result<(), BoxError> {
        let link_tx = self.link_tx.clone();
        let sync = PeriodicTask::spawn("clock-sync", self.settings.sync_interval, move || {
            link_tx
                .send(ClockSyncEstimator::request(get_milli_time()))
                .is_ok()
        })?;
        let scheduler = LookaheadScheduler::new(
            self.settings.schedule_ahead,
            self.trim,
            Box::new(ChannelPulseSink::new(self.pulse_tx.clone())),
        );
        let (scheduler, sched_tx) = spawn_scheduler(scheduler, self.settings.lookahead)?;
        self.tasks = Some(ClientTasks {
            sched_tx,
            _scheduler: scheduler,
            _sync: sync,
        });
        Ok(())
    }
}

/// This is the entry point for a metronome client.
///
/// Connects to `settings.server_url` (and keeps reconnecting), executes the
/// commands arriving on `commands` and sends every scheduled pulse on
/// `pulse_tx`.  Returns once the command channel closes.
pub fn run(
    settings: ClientSettings,
    commands: mpsc::Receiver<UserCommand>,
    pulse_tx: mpsc::Sender<Pulse>,
) -> Result<(), BoxError> {
    let link = SessionLink::open(&settings.server_url, RECONNECT_DELAY)?;
    let mut client = MetronomeClient::new(settings, link.tx.clone(), pulse_tx);
    loop {
        match link.rx.recv_timeout(POLL) {
            Ok(event) => client.handle_link(event, get_milli_time())?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("link thread exited"),
        }
        // commands wait while the link is down, the link drops stale sends
        while client.is_connected() {
            match commands.try_recv() {
                Ok(cmd) => client.handle_user(cmd)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("no more commands, client done");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod test_metronome_client {
    use super::*;
    use crate::common::timing::Meter;

    struct Harness {
        client: MetronomeClient,
        link_rx: mpsc::Receiver<ClientEvent>,
        pulse_rx: mpsc::Receiver<Pulse>,
    }

    fn harness() -> Harness {
        let settings = ClientSettings {
            server_url: "ws://localhost:3001".to_string(),
            sync_interval: Duration::from_millis(20),
            lookahead: Duration::from_millis(5),
            schedule_ahead: Duration::from_millis(100),
            manual_trim_ms: 0.0,
        };
        let (link_tx, link_rx) = mpsc::channel();
        let (pulse_tx, pulse_rx) = mpsc::channel();
        Harness {
            client: MetronomeClient::new(settings, link_tx, pulse_tx),
            link_rx,
            pulse_rx,
        }
    }

    fn member(conn: ConnectionId, name: &str, is_host: bool, joined_at: i64) -> Member {
        Member {
            connection_id: conn,
            name: name.to_string(),
            is_host,
            joined_at,
        }
    }

    fn snapshot(is_host: bool, members: Vec<Member>, timing: TimingState) -> SessionSnapshot {
        SessionSnapshot {
            code: "AB12CD".to_string(),
            id: "id-1".to_string(),
            is_host,
            members,
            timing,
        }
    }

    #[test]
    fn user_commands_parse() {
        assert_eq!(
            UserCommand::parse("join ab12cd Grace Hopper").unwrap(),
            UserCommand::Join {
                code: "ab12cd".to_string(),
                name: "Grace Hopper".to_string()
            }
        );
        assert_eq!(UserCommand::parse(" tempo 90 ").unwrap(), UserCommand::Tempo(90));
        assert_eq!(UserCommand::parse("trim -12.5").unwrap(), UserCommand::Trim(-12.5));
        assert_eq!(
            UserCommand::parse("meter 7/8").unwrap(),
            UserCommand::Meter("7/8".to_string())
        );
        assert!(UserCommand::parse("create").is_err());
        assert!(UserCommand::parse("tempo fast").is_err());
        assert!(UserCommand::parse("dance").is_err());
    }

    #[test]
    fn user_commands_go_to_the_link() {
        let mut h = harness();
        h.client
            .handle_user(UserCommand::Create {
                name: "Ada".to_string(),
            })
            .unwrap();
        assert_eq!(
            h.link_rx.try_recv().unwrap(),
            ClientEvent::CreateSession {
                name: "Ada".to_string()
            }
        );
        // trim stays local
        h.client.handle_user(UserCommand::Trim(4.0)).unwrap();
        assert!(h.link_rx.try_recv().is_err());
    }

    #[test]
    fn creating_starts_sync_and_leaving_stops_it() {
        let mut h = harness();
        h.client
            .handle_event(
                ServerEvent::SessionCreated(snapshot(
                    true,
                    vec![member(1, "Ada", true, 0)],
                    TimingState::default(),
                )),
                0,
            )
            .unwrap();
        let view = h.client.view().unwrap();
        assert!(view.is_host);
        assert_eq!(view.me, Some(1));
        assert!(h.client.tasks_running());
        match h.link_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ClientEvent::SyncRequest { .. } => {}
            other => panic!("unexpected {:?}", other),
        }

        h.client.handle_event(ServerEvent::SessionLeft {}, 10).unwrap();
        assert!(h.client.view().is_none());
        assert!(!h.client.tasks_running());
        // nothing keeps sending once the task is gone
        thread_drain(&h.link_rx);
        std::thread::sleep(Duration::from_millis(60));
        assert!(h.link_rx.try_recv().is_err());
    }

    fn thread_drain(rx: &mpsc::Receiver<ClientEvent>) {
        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn joining_a_playing_session_produces_pulses() {
        let mut h = harness();
        let now = get_milli_time();
        let timing = TimingState {
            is_playing: true,
            bpm: 300,
            meter: "4/4".parse::<Meter>().unwrap(),
            epoch_start: Some(now - 1_000),
        };
        h.client
            .handle_event(
                ServerEvent::SessionJoined(snapshot(
                    false,
                    vec![member(1, "Ada", true, 0), member(2, "Grace", false, 5)],
                    timing,
                )),
                now,
            )
            .unwrap();
        assert_eq!(h.client.view().unwrap().me, Some(2));
        let pulse = h.pulse_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(pulse.index >= 5);

        h.client.handle_event(ServerEvent::TimingStopped {}, now).unwrap();
        let view = h.client.view().unwrap();
        assert!(!view.timing.is_playing);
        assert_eq!(view.timing.bpm, 300);
        std::thread::sleep(Duration::from_millis(30));
        while h.pulse_rx.try_recv().is_ok() {}
        std::thread::sleep(Duration::from_millis(300));
        assert!(h.pulse_rx.try_recv().is_err());
    }

    #[test]
    fn membership_and_host_handoff() {
        let mut h = harness();
        h.client
            .handle_event(
                ServerEvent::SessionJoined(snapshot(
                    false,
                    vec![member(1, "Ada", true, 0), member(2, "Grace", false, 5)],
                    TimingState::default(),
                )),
                0,
            )
            .unwrap();
        h.client
            .handle_event(
                ServerEvent::MemberJoined {
                    member: member(3, "Linus", false, 9),
                },
                0,
            )
            .unwrap();
        assert_eq!(h.client.view().unwrap().members.len(), 3);
        assert!(!h.client.view().unwrap().is_host);

        h.client
            .handle_event(ServerEvent::MemberLeft { connection_id: 1 }, 0)
            .unwrap();
        let view = h.client.view().unwrap();
        assert!(view.is_host);
        assert_eq!(view.members.len(), 2);
        assert!(view.members.iter().any(|m| m.connection_id == 2 && m.is_host));
        assert!(view.members.iter().any(|m| m.connection_id == 3 && !m.is_host));
    }

    #[test]
    fn repeated_join_keeps_our_identity() {
        let mut h = harness();
        h.client
            .handle_event(
                ServerEvent::SessionJoined(snapshot(
                    false,
                    vec![member(1, "Ada", true, 0), member(2, "Grace", false, 5)],
                    TimingState::default(),
                )),
                0,
            )
            .unwrap();
        // Linus arrived after us, then we joined the same session again
        h.client
            .handle_event(
                ServerEvent::SessionJoined(snapshot(
                    false,
                    vec![
                        member(1, "Ada", true, 0),
                        member(2, "Grace", false, 5),
                        member(3, "Linus", false, 9),
                    ],
                    TimingState::default(),
                )),
                10,
            )
            .unwrap();
        assert_eq!(h.client.view().unwrap().me, Some(2));
        h.client
            .handle_event(ServerEvent::MemberLeft { connection_id: 1 }, 11)
            .unwrap();
        assert!(h.client.view().unwrap().is_host);
    }

    #[test]
    fn sync_responses_set_the_offset() {
        let mut h = harness();
        h.client
            .handle_event(
                ServerEvent::SyncResponse {
                    client_time: 1000,
                    authority_time: 1080,
                },
                1040,
            )
            .unwrap();
        assert_eq!(h.client.offset(), 60.0);
    }

    #[test]
    fn errors_are_kept_for_display() {
        let mut h = harness();
        h.client
            .handle_event(ServerEvent::error("Session not found"), 0)
            .unwrap();
        assert_eq!(h.client.last_error(), Some("Session not found"));
    }

    #[test]
    fn link_drop_tears_everything_down() {
        let mut h = harness();
        h.client.handle_link(LinkEvent::Connected, 0).unwrap();
        assert!(h.client.is_connected());
        h.client
            .handle_link(
                LinkEvent::Event(ServerEvent::SessionCreated(snapshot(
                    true,
                    vec![member(1, "Ada", true, 0)],
                    TimingState::default(),
                ))),
                0,
            )
            .unwrap();
        assert!(h.client.tasks_running());
        h.client.handle_link(LinkEvent::Disconnected, 5).unwrap();
        assert!(!h.client.is_connected());
        assert!(!h.client.tasks_running());
        assert!(h.client.view().is_none());
    }
}
