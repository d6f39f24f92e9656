//! In-memory registry of live sessions.
//!
//! The store keeps two maps: session code → [`Session`] and connection id →
//! session code.  Every operation that changes membership updates both before
//! returning, and every operation either completes or leaves the store exactly
//! as it found it.  The store knows nothing about the network or about who is
//! allowed to do what; that is [`super::session_authority::SessionAuthority`].
use chrono::{TimeZone, Utc};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::HashMap, fmt};
use uuid::Uuid;

use crate::common::{
    event_message::{ConnectionId, Member, SessionSnapshot},
    timing::{Meter, TimingState},
};

use super::session_error::SessionError;

// give up drawing codes after this many collisions in a row
const MAX_CODE_DRAWS: usize = 1000;

/// One isolated group of connections sharing a timing state.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub code: String,
    pub id: String,
    pub members: Vec<Member>,
    pub host: ConnectionId,
    pub timing: TimingState,
    pub created_at: i64,
    pub last_activity_at: i64,
}

impl Session {
    pub fn member(&self, conn: ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| m.connection_id == conn)
    }
    pub fn is_member(&self, conn: ConnectionId) -> bool {
        self.member(conn).is_some()
    }
    pub fn is_host(&self, conn: ConnectionId) -> bool {
        self.host == conn
    }
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.members.iter().map(|m| m.connection_id).collect()
    }
    /// every member except `conn`
    pub fn others(&self, conn: ConnectionId) -> Vec<ConnectionId> {
        self.members
            .iter()
            .map(|m| m.connection_id)
            .filter(|c| *c != conn)
            .collect()
    }
    /// The view of this session sent to `conn`.
    pub fn snapshot_for(&self, conn: ConnectionId) -> SessionSnapshot {
        SessionSnapshot {
            code: self.code.clone(),
            id: self.id.clone(),
            is_host: self.is_host(conn),
            members: self.members.clone(),
            timing: self.timing.clone(),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ code: {}, host: {}, members: [", self.code, self.host)?;
        for m in &self.members {
            write!(f, " {}({}),", m.name, m.connection_id)?;
        }
        write!(f, " ], timing: {} }}", self.timing)
    }
}

/// A partial update of a session's [`TimingState`].  `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingPatch {
    pub is_playing: Option<bool>,
    pub bpm: Option<u32>,
    pub meter: Option<Meter>,
    pub epoch_start: Option<Option<i64>>,
}

impl TimingPatch {
    fn apply(&self, timing: &mut TimingState) -> () {
        if let Some(p) = self.is_playing {
            timing.is_playing = p;
        }
        if let Some(b) = self.bpm {
            timing.bpm = b;
        }
        if let Some(m) = self.meter {
            timing.meter = m;
        }
        if let Some(e) = self.epoch_start {
            timing.epoch_start = e;
        }
    }
}

/// Summary of one session for the stats log.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStat {
    pub code: String,
    pub member_count: usize,
    pub is_playing: bool,
    pub bpm: u32,
    pub created_at: i64,
    pub last_activity_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub total_sessions: usize,
    pub total_connections: usize,
    pub sessions: Vec<SessionStat>,
}

fn format_millis(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.to_rfc3339(),
        None => ms.to_string(),
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "sessions: {}, connections: {}",
            self.total_sessions, self.total_connections
        )?;
        for s in &self.sessions {
            write!(
                f,
                "\n  {} members: {} playing: {} bpm: {} created: {} active: {}",
                s.code,
                s.member_count,
                s.is_playing,
                s.bpm,
                format_millis(s.created_at),
                format_millis(s.last_activity_at)
            )?;
        }
        Ok(())
    }
}

pub struct SessionStore {
    sessions: HashMap<String, Session>,
    by_connection: HashMap<ConnectionId, String>,
    code_length: usize,
    alphabet: Vec<char>,
    rng: StdRng,
}

impl SessionStore {
    pub fn new(code_length: usize, alphabet: &str) -> SessionStore {
        Self::with_rng(code_length, alphabet, StdRng::from_entropy())
    }

    /// A store whose session codes are reproducible.  Used by tests.
    pub fn with_seed(code_length: usize, alphabet: &str, seed: u64) -> SessionStore {
        Self::with_rng(code_length, alphabet, StdRng::seed_from_u64(seed))
    }

    fn with_rng(code_length: usize, alphabet: &str, rng: StdRng) -> SessionStore {
        SessionStore {
            sessions: HashMap::new(),
            by_connection: HashMap::new(),
            code_length,
            alphabet: alphabet.chars().collect(),
            rng,
        }
    }

    /// A code no live session uses.  Nothing is reserved, the code stays free
    /// until a session is created with it.
    pub fn draw_code(&mut self) -> Result<String, SessionError> {
        if self.alphabet.is_empty() || self.code_length == 0 {
            return Err(SessionError::internal("session code alphabet is empty"));
        }
        for _ in 0..MAX_CODE_DRAWS {
            let code: String = (0..self.code_length)
                .map(|_| self.alphabet[self.rng.gen_range(0..self.alphabet.len())])
                .collect();
            if !self.sessions.contains_key(&code) {
                return Ok(code);
            }
            debug!("session code {} collided, drawing again", code);
        }
        Err(SessionError::internal("no free session code"))
    }

    /// Create a session with `member` as its only member and host.
    pub fn create(&mut self, member: Member, now: i64) -> Result<Session, SessionError> {
        if let Some(code) = self.by_connection.get(&member.connection_id) {
            return Err(SessionError::internal(format!(
                "connection {} already belongs to {}",
                member.connection_id, code
            )));
        }
        let code = self.draw_code()?;
        self.create_with_code(code, member, now)
    }

    /// Same as [`SessionStore::create`] with a code from an earlier
    /// [`SessionStore::draw_code`].
    pub fn create_with_code(
        &mut self,
        code: String,
        mut member: Member,
        now: i64,
    ) -> Result<Session, SessionError> {
        if let Some(existing) = self.by_connection.get(&member.connection_id) {
            return Err(SessionError::internal(format!(
                "connection {} already belongs to {}",
                member.connection_id, existing
            )));
        }
        if self.sessions.contains_key(&code) {
            return Err(SessionError::internal(format!("session code {} is taken", code)));
        }
        member.is_host = true;
        let session = Session {
            code: code.clone(),
            id: Uuid::new_v4().to_string(),
            host: member.connection_id,
            members: vec![member],
            timing: TimingState::default(),
            created_at: now,
            last_activity_at: now,
        };
        self.by_connection.insert(session.host, code.clone());
        self.sessions.insert(code, session.clone());
        info!("session created: {}", session);
        Ok(session)
    }

    pub fn get(&self, code: &str) -> Option<Session> {
        self.sessions.get(code).cloned()
    }

    pub fn get_by_connection(&self, conn: ConnectionId) -> Option<Session> {
        self.by_connection
            .get(&conn)
            .and_then(|code| self.sessions.get(code))
            .cloned()
    }

    /// code of the session `conn` belongs to
    pub fn code_for(&self, conn: ConnectionId) -> Option<&str> {
        self.by_connection.get(&conn).map(|c| c.as_str())
    }

    pub fn add_member(
        &mut self,
        code: &str,
        mut member: Member,
        now: i64,
    ) -> Result<Session, SessionError> {
        if let Some(existing) = self.by_connection.get(&member.connection_id) {
            return Err(SessionError::internal(format!(
                "connection {} already belongs to {}",
                member.connection_id, existing
            )));
        }
        let session = self
            .sessions
            .get_mut(code)
            .ok_or_else(|| SessionError::SessionNotFound {
                code: code.to_string(),
            })?;
        member.is_host = false;
        let conn = member.connection_id;
        session.members.push(member);
        let session = Self::touch_session(session, now).clone();
        self.by_connection.insert(conn, code.to_string());
        Ok(session)
    }

    /// Mark the session as active at `now`.  False when there is no such
    /// session.
    pub fn touch(&mut self, code: &str, now: i64) -> bool {
        match self.sessions.get_mut(code) {
            Some(session) => {
                Self::touch_session(session, now);
                true
            }
            None => false,
        }
    }

    fn touch_session(session: &mut Session, now: i64) -> &mut Session {
        session.last_activity_at = now;
        session
    }

    /// Remove `conn` from whatever session it is in.
    ///
    /// Returns the session as it is after the removal, or `None` when the
    /// connection was in no session or when it was the last member (the
    /// session is deleted in that case).
    pub fn remove_member(&mut self, conn: ConnectionId, now: i64) -> Option<Session> {
        let code = self.by_connection.remove(&conn)?;
        let session = self.sessions.get_mut(&code)?;
        session.members.retain(|m| m.connection_id != conn);
        Self::touch_session(session, now);

        if session.members.is_empty() {
            self.sessions.remove(&code);
            info!("session {} deleted (no members left)", code);
            return None;
        }
        if session.host == conn {
            // earliest joiner takes over, connection id breaks ties
            if let Some(next) = session
                .members
                .iter_mut()
                .min_by_key(|m| (m.joined_at, m.connection_id))
            {
                next.is_host = true;
                session.host = next.connection_id;
                info!(
                    "host of {} handed to {} ({})",
                    code, next.name, next.connection_id
                );
            }
        }
        Some(session.clone())
    }

    pub fn mutate_timing(
        &mut self,
        code: &str,
        patch: &TimingPatch,
        now: i64,
    ) -> Result<Session, SessionError> {
        let session = self
            .sessions
            .get_mut(code)
            .ok_or_else(|| SessionError::SessionNotFound {
                code: code.to_string(),
            })?;
        patch.apply(&mut session.timing);
        Ok(Self::touch_session(session, now).clone())
    }

    /// Delete a whole session and unbind all its members.
    pub fn remove_session(&mut self, code: &str) -> Option<Session> {
        let session = self.sessions.remove(code)?;
        for m in &session.members {
            self.by_connection.remove(&m.connection_id);
        }
        Some(session)
    }

    /// codes of sessions with no activity for longer than `idle_ms`
    pub fn expired(&self, now: i64, idle_ms: i64) -> Vec<String> {
        let mut codes: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now - s.last_activity_at > idle_ms)
            .map(|s| s.code.clone())
            .collect();
        codes.sort();
        codes
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let mut sessions: Vec<SessionStat> = self
            .sessions
            .values()
            .map(|s| SessionStat {
                code: s.code.clone(),
                member_count: s.members.len(),
                is_playing: s.timing.is_playing,
                bpm: s.timing.bpm,
                created_at: s.created_at,
                last_activity_at: s.last_activity_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.code.cmp(&b.code));
        StoreStats {
            total_sessions: self.sessions.len(),
            total_connections: self.by_connection.len(),
            sessions,
        }
    }

    /// Check that both maps describe the same membership and that every
    /// session has exactly one host.  Only used by tests.
    #[cfg(test)]
    pub fn check_invariants(&self) -> () {
        let mut bound = 0;
        for (code, s) in &self.sessions {
            assert_eq!(&s.code, code);
            assert!(!s.members.is_empty(), "empty session {}", code);
            let hosts: Vec<&Member> = s.members.iter().filter(|m| m.is_host).collect();
            assert_eq!(hosts.len(), 1, "session {} has {} hosts", code, hosts.len());
            assert_eq!(hosts[0].connection_id, s.host);
            for m in &s.members {
                assert_eq!(self.by_connection.get(&m.connection_id), Some(code));
                bound += 1;
            }
        }
        assert_eq!(bound, self.by_connection.len());
    }
}

#[cfg(test)]
mod test_session_store {
    use super::*;

    const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    fn member(conn: ConnectionId, name: &str, joined_at: i64) -> Member {
        Member {
            connection_id: conn,
            name: name.to_string(),
            is_host: false,
            joined_at,
        }
    }

    fn store() -> SessionStore {
        SessionStore::with_seed(6, ALPHABET, 7)
    }

    #[test]
    fn create_makes_sole_host() {
        let mut s = store();
        let session = s.create(member(1, "Ada", 100), 100).unwrap();
        assert_eq!(session.code.len(), 6);
        assert!(session.code.chars().all(|c| ALPHABET.contains(c)));
        assert_eq!(session.members.len(), 1);
        assert!(session.members[0].is_host);
        assert_eq!(session.host, 1);
        assert_eq!(session.timing, TimingState::default());
        assert_eq!(s.get_by_connection(1), Some(session.clone()));
        assert_eq!(s.get(&session.code), Some(session));
        s.check_invariants();
    }

    #[test]
    fn codes_are_unique_even_with_tiny_alphabet() {
        // 2 letters, length 2: only 4 codes exist
        let mut s = SessionStore::with_seed(2, "AB", 1);
        let mut codes = vec![];
        for conn in 0..4 {
            codes.push(s.create(member(conn, "x", 0), 0).unwrap().code);
        }
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 4);
        // the space is exhausted now
        let e = s.create(member(9, "x", 0), 0).unwrap_err();
        assert_eq!(e.kind(), crate::server::session_error::ErrorKind::Internal);
        assert_eq!(s.len(), 4);
        s.check_invariants();
    }

    #[test]
    fn create_rejects_bound_connection() {
        let mut s = store();
        s.create(member(1, "Ada", 0), 0).unwrap();
        assert!(s.create(member(1, "Ada", 0), 0).is_err());
        assert_eq!(s.len(), 1);
        s.check_invariants();
    }

    #[test]
    fn add_member_keeps_join_order() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        s.add_member(&code, member(2, "Grace", 10), 10).unwrap();
        let session = s.add_member(&code, member(3, "Linus", 20), 20).unwrap();
        let names: Vec<&str> = session.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Grace", "Linus"]);
        assert_eq!(session.last_activity_at, 20);
        assert!(!session.members[1].is_host);
        s.check_invariants();
    }

    #[test]
    fn add_member_to_unknown_session() {
        let mut s = store();
        let e = s.add_member("NOPE42", member(2, "Grace", 0), 0).unwrap_err();
        assert_eq!(
            e,
            SessionError::SessionNotFound {
                code: "NOPE42".to_string()
            }
        );
        assert!(s.get_by_connection(2).is_none());
        s.check_invariants();
    }

    #[test]
    fn removing_host_promotes_earliest_joiner() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        s.add_member(&code, member(5, "Grace", 10), 10).unwrap();
        s.add_member(&code, member(3, "Linus", 20), 20).unwrap();
        let after = s.remove_member(1, 30).unwrap();
        assert_eq!(after.host, 5);
        assert!(after.member(5).unwrap().is_host);
        assert!(!after.member(3).unwrap().is_host);
        assert!(s.get_by_connection(1).is_none());
        s.check_invariants();
    }

    #[test]
    fn handoff_ties_break_on_connection_id() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        s.add_member(&code, member(9, "Grace", 10), 10).unwrap();
        s.add_member(&code, member(4, "Linus", 10), 10).unwrap();
        let after = s.remove_member(1, 30).unwrap();
        assert_eq!(after.host, 4);
        s.check_invariants();
    }

    #[test]
    fn removing_guest_keeps_host() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        s.add_member(&code, member(2, "Grace", 10), 10).unwrap();
        let after = s.remove_member(2, 30).unwrap();
        assert_eq!(after.host, 1);
        assert_eq!(after.members.len(), 1);
        s.check_invariants();
    }

    #[test]
    fn removing_last_member_deletes_session() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        assert!(s.remove_member(1, 5).is_none());
        assert!(s.get(&code).is_none());
        assert!(s.is_empty());
        s.check_invariants();
    }

    #[test]
    fn removing_unknown_connection_is_none() {
        let mut s = store();
        assert!(s.remove_member(77, 0).is_none());
    }

    #[test]
    fn mutate_timing_applies_patch() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        let patch = TimingPatch {
            is_playing: Some(true),
            epoch_start: Some(Some(1234)),
            ..Default::default()
        };
        let after = s.mutate_timing(&code, &patch, 50).unwrap();
        assert!(after.timing.is_playing);
        assert_eq!(after.timing.epoch_start, Some(1234));
        assert_eq!(after.timing.bpm, 120);
        assert_eq!(after.last_activity_at, 50);
        assert!(s.mutate_timing("NOPE42", &patch, 50).is_err());
    }

    #[test]
    fn expiry_and_remove_session() {
        let mut s = store();
        let old = s.create(member(1, "Ada", 0), 0).unwrap().code;
        s.add_member(&old, member(2, "Grace", 0), 0).unwrap();
        let fresh = s.create(member(3, "Linus", 900), 900).unwrap().code;
        assert_eq!(s.expired(1000, 500), vec![old.clone()]);
        let removed = s.remove_session(&old).unwrap();
        assert_eq!(removed.members.len(), 2);
        assert!(s.get_by_connection(1).is_none());
        assert!(s.get_by_connection(2).is_none());
        assert!(s.get(&fresh).is_some());
        s.check_invariants();
    }

    #[test]
    fn touch_moves_activity_only() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        assert!(s.touch(&code, 700));
        let session = s.get(&code).unwrap();
        assert_eq!(session.last_activity_at, 700);
        assert_eq!(session.created_at, 0);
        assert_eq!(session.timing, TimingState::default());
        assert_eq!(s.expired(1000, 500), Vec::<String>::new());
        assert!(!s.touch("NOPE42", 700));
    }

    #[test]
    fn drawn_code_is_used_for_creation() {
        let mut s = store();
        let code = s.draw_code().unwrap();
        assert!(s.is_empty());
        let session = s
            .create_with_code(code.clone(), member(1, "Ada", 0), 0)
            .unwrap();
        assert_eq!(session.code, code);
        // the code is taken now, and so is the connection
        assert!(s.create_with_code(code.clone(), member(2, "Grace", 0), 0).is_err());
        let other = s.draw_code().unwrap();
        assert!(s.create_with_code(other, member(1, "Ada", 0), 0).is_err());
        assert_eq!(s.len(), 1);
        s.check_invariants();
    }

    #[test]
    fn stats_count_everything() {
        let mut s = store();
        let code = s.create(member(1, "Ada", 0), 0).unwrap().code;
        s.add_member(&code, member(2, "Grace", 0), 0).unwrap();
        s.create(member(3, "Linus", 0), 0).unwrap();
        let stats = s.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_connections, 3);
        assert_eq!(
            stats.sessions.iter().map(|x| x.member_count).sum::<usize>(),
            3
        );
        assert!(stats.to_string().starts_with("sessions: 2, connections: 3"));
    }
}
