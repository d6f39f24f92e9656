//! Turns client events into authority calls and authority results into
//! outgoing events.
//!
//! The adapter does no I/O.  Each call returns the list of [`Envelope`]s to
//! deliver, and the server thread routes them to the connections.  Events from
//! a connection the adapter does not know (never connected, or already
//! disconnected) are dropped so a late event can never re-create state after
//! its connection's cleanup ran.
//!
//! Which session a connection is bound to is read from the store, the adapter
//! only remembers which connections are up.
use log::{debug, error, info, warn};
use std::collections::HashSet;

use crate::common::{
    config::ServerSettings,
    event_message::{ClientEvent, ConnectionId, ServerEvent},
};

use super::{
    session_authority::{normalize_code, SessionAuthority},
    session_error::{ErrorKind, SessionError},
    session_store::{Session, StoreStats},
};

/// One event addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub to: ConnectionId,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn new(to: ConnectionId, event: ServerEvent) -> Envelope {
        Envelope { to, event }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Unbound,
    Bound(String),
}

pub struct SessionProtocolAdapter {
    authority: SessionAuthority,
    links: HashSet<ConnectionId>,
}

fn to_all(session: &Session, event: ServerEvent) -> Vec<Envelope> {
    session
        .connection_ids()
        .into_iter()
        .map(|c| Envelope::new(c, event.clone()))
        .collect()
}

fn to_others(session: &Session, conn: ConnectionId, event: ServerEvent) -> Vec<Envelope> {
    session
        .others(conn)
        .into_iter()
        .map(|c| Envelope::new(c, event.clone()))
        .collect()
}

/// What the rest of a session hears when `conn` walks out of it.
fn departure(conn: ConnectionId, left: Option<(String, Option<Session>)>) -> Vec<Envelope> {
    match left {
        Some((code, remaining)) => {
            debug!("connection {} unbound from {}", conn, code);
            match remaining {
                Some(session) => to_others(
                    &session,
                    conn,
                    ServerEvent::MemberLeft {
                        connection_id: conn,
                    },
                ),
                None => vec![],
            }
        }
        None => vec![],
    }
}

impl SessionProtocolAdapter {
    pub fn new(settings: &ServerSettings) -> SessionProtocolAdapter {
        Self::with_authority(SessionAuthority::new(settings))
    }

    pub fn with_authority(authority: SessionAuthority) -> SessionProtocolAdapter {
        SessionProtocolAdapter {
            authority,
            links: HashSet::new(),
        }
    }

    pub fn authority(&self) -> &SessionAuthority {
        &self.authority
    }

    /// `None` for a connection that is not up.
    pub fn link_state(&self, conn: ConnectionId) -> Option<LinkState> {
        if !self.links.contains(&conn) {
            return None;
        }
        match self.authority.store().code_for(conn) {
            Some(code) => Some(LinkState::Bound(code.to_string())),
            None => Some(LinkState::Unbound),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.authority.store().stats()
    }

    /// A transport connection came up.
    pub fn connect(&mut self, conn: ConnectionId) -> () {
        debug!("connection {} up", conn);
        self.links.insert(conn);
    }

    /// A frame from `conn` could not be decoded into a [`ClientEvent`].
    pub fn malformed(&mut self, conn: ConnectionId) -> Vec<Envelope> {
        if !self.links.contains(&conn) {
            return vec![];
        }
        vec![Envelope::new(conn, ServerEvent::error(SessionError::MalformedEvent))]
    }

    pub fn handle_event(
        &mut self,
        conn: ConnectionId,
        event: ClientEvent,
        now: i64,
    ) -> Vec<Envelope> {
        if !self.links.contains(&conn) {
            warn!("dropping {} from unknown connection {}", event.name(), conn);
            return vec![];
        }
        let name = event.name();
        match self.dispatch(conn, event, now) {
            Ok(out) => out,
            Err(e) => {
                match e.kind() {
                    ErrorKind::Internal => error!("{} from {} failed: {:?}", name, conn, e),
                    _ => debug!("{} from {} rejected: {}", name, conn, e),
                }
                vec![Envelope::new(conn, ServerEvent::error(&e))]
            }
        }
    }

    fn dispatch(
        &mut self,
        conn: ConnectionId,
        event: ClientEvent,
        now: i64,
    ) -> Result<Vec<Envelope>, SessionError> {
        match event {
            ClientEvent::CreateSession { name } => self.create(conn, &name, now),
            ClientEvent::JoinSession { code, name } => self.join(conn, &code, &name, now),
            ClientEvent::LeaveSession => Ok(self.leave(conn, now, true)),
            ClientEvent::StartTiming => {
                let code = self.bound_code(conn)?;
                let session = self.authority.start_timing(&code, conn, now)?;
                let event = match session.timing.epoch_start {
                    Some(epoch_start) => ServerEvent::TimingStarted {
                        epoch_start,
                        bpm: session.timing.bpm,
                        meter: session.timing.meter,
                    },
                    None => return Err(SessionError::internal("started without an epoch")),
                };
                info!("timing started in {} at {}", code, now);
                Ok(to_all(&session, event))
            }
            ClientEvent::StopTiming => {
                let code = self.bound_code(conn)?;
                let session = self.authority.stop_timing(&code, conn, now)?;
                info!("timing stopped in {}", code);
                Ok(to_all(&session, ServerEvent::TimingStopped {}))
            }
            ClientEvent::SetTempo { bpm } => {
                let code = self.bound_code(conn)?;
                let session = self.authority.set_tempo(&code, conn, bpm, now)?;
                info!("tempo in {} now {}", code, bpm);
                Ok(to_all(&session, ServerEvent::TimingUpdated(session.timing.clone())))
            }
            ClientEvent::SetMeter { meter } => {
                let code = self.bound_code(conn)?;
                let session = self.authority.set_meter(&code, conn, &meter, now)?;
                info!("meter in {} now {}", code, session.timing.meter);
                Ok(to_all(&session, ServerEvent::TimingUpdated(session.timing.clone())))
            }
            ClientEvent::SyncRequest { client_time } => Ok(vec![Envelope::new(
                conn,
                ServerEvent::SyncResponse {
                    client_time,
                    authority_time: now,
                },
            )]),
        }
    }

    fn bound_code(&self, conn: ConnectionId) -> Result<String, SessionError> {
        self.authority
            .store()
            .code_for(conn)
            .map(String::from)
            .ok_or(SessionError::NotInSession)
    }

    fn create(
        &mut self,
        conn: ConnectionId,
        name: &str,
        now: i64,
    ) -> Result<Vec<Envelope>, SessionError> {
        // moving to a new session means leaving the current one first
        let (session, left) = self.authority.move_to_new_session(conn, name, now)?;
        let mut out = departure(conn, left);
        out.push(Envelope::new(
            conn,
            ServerEvent::SessionCreated(session.snapshot_for(conn)),
        ));
        Ok(out)
    }

    fn join(
        &mut self,
        conn: ConnectionId,
        code: &str,
        name: &str,
        now: i64,
    ) -> Result<Vec<Envelope>, SessionError> {
        SessionAuthority::clean_name(name)?;
        let code = normalize_code(code);
        self.authority.check_joinable(&code, conn)?;
        let already_in = self.authority.store().code_for(conn) == Some(code.as_str());
        let mut out = if already_in {
            vec![]
        } else {
            self.leave(conn, now, false)
        };
        let session = self.authority.join_session(&code, conn, name, now)?;
        out.push(Envelope::new(
            conn,
            ServerEvent::SessionJoined(session.snapshot_for(conn)),
        ));
        if !already_in {
            if let Some(member) = session.member(conn) {
                out.extend(to_others(
                    &session,
                    conn,
                    ServerEvent::MemberJoined {
                        member: member.clone(),
                    },
                ));
            }
        }
        Ok(out)
    }

    fn leave(&mut self, conn: ConnectionId, now: i64, acknowledge: bool) -> Vec<Envelope> {
        let left = self.authority.leave_session(conn, now);
        let was_bound = left.is_some();
        let mut out = departure(conn, left);
        if acknowledge && was_bound {
            out.push(Envelope::new(conn, ServerEvent::SessionLeft {}));
        }
        out
    }

    /// The transport connection is gone.  Same as a leave, minus the
    /// acknowledgment.
    pub fn disconnect(&mut self, conn: ConnectionId, now: i64) -> Vec<Envelope> {
        let out = self.leave(conn, now, false);
        self.links.remove(&conn);
        debug!("connection {} down", conn);
        out
    }

    /// Drop idle sessions and tell their members they are out.
    pub fn sweep(&mut self, now: i64) -> Vec<Envelope> {
        let mut out = vec![];
        for session in self.authority.sweep_idle(now) {
            for conn in session.connection_ids() {
                if self.links.contains(&conn) {
                    out.push(Envelope::new(conn, ServerEvent::SessionLeft {}));
                }
            }
        }
        out
    }
}
