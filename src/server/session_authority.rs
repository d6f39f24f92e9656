//! Membership, host role and timing rules on top of the [`SessionStore`].
//!
//! Every operation takes `now`, the authority's clock in milliseconds, so the
//! caller decides what time it is.  Control operations are authorized the same
//! way: the caller must be the session's current host, whether or not it is a
//! member at all.  Validation happens before anything is written, so a failed
//! call leaves the store untouched.
use log::{debug, info};

use crate::common::{
    config::ServerSettings,
    event_message::{ConnectionId, Member},
    timing::Meter,
};

use super::{
    session_error::SessionError,
    session_store::{Session, SessionStore, TimingPatch},
};

/// Session codes are matched without regard to case or surrounding blanks.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn host_member(conn: ConnectionId, name: String, now: i64) -> Member {
    Member {
        connection_id: conn,
        name,
        is_host: true,
        joined_at: now,
    }
}

pub struct SessionAuthority {
    store: SessionStore,
    max_members: usize,
    min_bpm: u32,
    max_bpm: u32,
    idle_timeout_ms: i64,
}

impl SessionAuthority {
    pub fn new(settings: &ServerSettings) -> SessionAuthority {
        Self::with_store(
            settings,
            SessionStore::new(settings.code_length, &settings.code_alphabet),
        )
    }

    pub fn with_store(settings: &ServerSettings, store: SessionStore) -> SessionAuthority {
        SessionAuthority {
            store,
            max_members: settings.max_members,
            min_bpm: settings.min_bpm,
            max_bpm: settings.max_bpm,
            idle_timeout_ms: settings.idle_timeout.as_millis() as i64,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn clean_name(name: &str) -> Result<String, SessionError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(SessionError::InvalidName);
        }
        Ok(trimmed.to_string())
    }

    pub fn create_session(
        &mut self,
        conn: ConnectionId,
        name: &str,
        now: i64,
    ) -> Result<Session, SessionError> {
        let name = Self::clean_name(name)?;
        self.store.create(host_member(conn, name, now), now)
    }

    /// Create a session for `conn` and take it out of the one it is in.
    ///
    /// The new code is drawn before anything changes, so on failure `conn`
    /// stays where it was.  Returns the new session and what
    /// [`SessionAuthority::leave_session`] gave for the old one.
    pub fn move_to_new_session(
        &mut self,
        conn: ConnectionId,
        name: &str,
        now: i64,
    ) -> Result<(Session, Option<(String, Option<Session>)>), SessionError> {
        let name = Self::clean_name(name)?;
        let code = self.store.draw_code()?;
        let left = self.leave_session(conn, now);
        let session = self
            .store
            .create_with_code(code, host_member(conn, name, now), now)?;
        Ok((session, left))
    }

    /// Join the session with `code` (any case).
    ///
    /// Joining a session the connection is already in returns that session
    /// unchanged.
    pub fn join_session(
        &mut self,
        code: &str,
        conn: ConnectionId,
        name: &str,
        now: i64,
    ) -> Result<Session, SessionError> {
        let name = Self::clean_name(name)?;
        let code = normalize_code(code);
        let session = self.check_joinable(&code, conn)?;
        if session.is_member(conn) {
            debug!("connection {} already in {}", conn, code);
            return Ok(session);
        }
        let session = self.store.add_member(
            &code,
            Member {
                connection_id: conn,
                name,
                is_host: false,
                joined_at: now,
            },
            now,
        )?;
        info!("connection {} joined {}", conn, code);
        Ok(session)
    }

    /// The session `conn` could join right now, without changing anything.
    ///
    /// `code` must already be normalized.
    pub fn check_joinable(&self, code: &str, conn: ConnectionId) -> Result<Session, SessionError> {
        let session = self
            .store
            .get(code)
            .ok_or_else(|| SessionError::SessionNotFound {
                code: code.to_string(),
            })?;
        if !session.is_member(conn) && session.members.len() >= self.max_members {
            return Err(SessionError::SessionFull {
                code: code.to_string(),
                capacity: self.max_members,
            });
        }
        Ok(session)
    }

    /// Remove `conn` from its session.
    ///
    /// Returns the code of the session it left and the session as it is now
    /// (`None` if it was deleted).  Returns `None` when the connection was in
    /// no session.
    pub fn leave_session(
        &mut self,
        conn: ConnectionId,
        now: i64,
    ) -> Option<(String, Option<Session>)> {
        let code = self.store.code_for(conn)?.to_string();
        let remaining = self.store.remove_member(conn, now);
        info!("connection {} left {}", conn, code);
        Some((code, remaining))
    }

    fn authorize(&self, code: &str, conn: ConnectionId) -> Result<Session, SessionError> {
        match self.store.get(code) {
            Some(session) if session.is_host(conn) => Ok(session),
            _ => Err(SessionError::NotHost),
        }
    }

    pub fn start_timing(
        &mut self,
        code: &str,
        conn: ConnectionId,
        now: i64,
    ) -> Result<Session, SessionError> {
        self.authorize(code, conn)?;
        let patch = TimingPatch {
            is_playing: Some(true),
            epoch_start: Some(Some(now)),
            ..Default::default()
        };
        self.store.mutate_timing(code, &patch, now)
    }

    pub fn stop_timing(
        &mut self,
        code: &str,
        conn: ConnectionId,
        now: i64,
    ) -> Result<Session, SessionError> {
        self.authorize(code, conn)?;
        let patch = TimingPatch {
            is_playing: Some(false),
            epoch_start: Some(None),
            ..Default::default()
        };
        self.store.mutate_timing(code, &patch, now)
    }

    /// Change the tempo.  The epoch is left where it is.
    pub fn set_tempo(
        &mut self,
        code: &str,
        conn: ConnectionId,
        bpm: i64,
        now: i64,
    ) -> Result<Session, SessionError> {
        self.authorize(code, conn)?;
        if bpm < self.min_bpm as i64 || bpm > self.max_bpm as i64 {
            return Err(SessionError::InvalidTempo {
                bpm,
                min: self.min_bpm,
                max: self.max_bpm,
            });
        }
        let patch = TimingPatch {
            bpm: Some(bpm as u32),
            ..Default::default()
        };
        self.store.mutate_timing(code, &patch, now)
    }

    pub fn set_meter(
        &mut self,
        code: &str,
        conn: ConnectionId,
        meter: &str,
        now: i64,
    ) -> Result<Session, SessionError> {
        self.authorize(code, conn)?;
        let meter: Meter = meter.parse().map_err(|_| SessionError::InvalidMeter {
            meter: meter.to_string(),
        })?;
        let patch = TimingPatch {
            meter: Some(meter),
            ..Default::default()
        };
        self.store.mutate_timing(code, &patch, now)
    }

    /// Delete every session idle for longer than the configured timeout.
    pub fn sweep_idle(&mut self, now: i64) -> Vec<Session> {
        let codes = self.store.expired(now, self.idle_timeout_ms);
        codes
            .iter()
            .filter_map(|code| {
                let removed = self.store.remove_session(code);
                if removed.is_some() {
                    info!("swept idle session {}", code);
                }
                removed
            })
            .collect()
    }
}
