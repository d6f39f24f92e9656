//! entry point called by main to run the session server
//!
//! This will create some threads to
//! - accept websocket connections, one thread per connection
//! - own the [`SessionProtocolAdapter`] and apply every command in arrival order
//! - periodically ask the authority thread to sweep idle sessions
//!
//! Connection threads never touch session state.  They forward decoded events
//! (and finally their disconnect) on a single channel to the authority thread,
//! which routes the resulting envelopes back to each connection's own channel.
//! Sync requests are the exception: they need no session state, so the
//! connection thread answers them itself with the time of the write.
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::mpsc,
    thread::{self, JoinHandle},
};
use tungstenite::WebSocket;

use crate::common::{
    box_error::BoxError,
    config::ServerSettings,
    event_message::{ClientEvent, ConnectionId, ServerEvent},
    get_milli_time,
    periodic_task::PeriodicTask,
    websocket,
};

use super::protocol_adapter::{Envelope, SessionProtocolAdapter};

/// Work for the authority thread.
#[derive(Debug)]
pub enum AuthorityCommand {
    Connected {
        conn: ConnectionId,
        tx: mpsc::Sender<ServerEvent>,
    },
    Event {
        conn: ConnectionId,
        event: ClientEvent,
    },
    Malformed {
        conn: ConnectionId,
    },
    Disconnected {
        conn: ConnectionId,
    },
    Sweep,
}

type Routes = HashMap<ConnectionId, mpsc::Sender<ServerEvent>>;

/// Apply one command at authority time `now` and deliver what it produced.
fn apply(
    adapter: &mut SessionProtocolAdapter,
    routes: &mut Routes,
    cmd: AuthorityCommand,
    now: i64,
) -> () {
    let out = match cmd {
        AuthorityCommand::Connected { conn, tx } => {
            routes.insert(conn, tx);
            adapter.connect(conn);
            vec![]
        }
        AuthorityCommand::Event { conn, event } => adapter.handle_event(conn, event, now),
        AuthorityCommand::Malformed { conn } => adapter.malformed(conn),
        AuthorityCommand::Disconnected { conn } => {
            routes.remove(&conn);
            adapter.disconnect(conn, now)
        }
        AuthorityCommand::Sweep => {
            let out = adapter.sweep(now);
            info!("{}", adapter.stats());
            out
        }
    };
    deliver(routes, out);
}

fn deliver(routes: &Routes, out: Vec<Envelope>) -> () {
    for envelope in out {
        match routes.get(&envelope.to) {
            Some(tx) => {
                if tx.send(envelope.event).is_err() {
                    debug!("connection {} is closing, dropped event", envelope.to);
                }
            }
            None => debug!("no route to connection {}", envelope.to),
        }
    }
}

/// Runs until every command sender is gone.
pub fn authority_thread(
    mut adapter: SessionProtocolAdapter,
    cmd_rx: mpsc::Receiver<AuthorityCommand>,
) -> () {
    let mut routes = Routes::new();
    for cmd in cmd_rx.iter() {
        apply(&mut adapter, &mut routes, cmd, get_milli_time());
    }
    info!("authority thread done");
}

fn sync_reply(client_time: i64) -> ServerEvent {
    ServerEvent::SyncResponse {
        client_time,
        authority_time: get_milli_time(),
    }
}

fn pump(
    sock: &mut WebSocket<TcpStream>,
    conn: ConnectionId,
    cmd_tx: &mpsc::Sender<AuthorityCommand>,
    out_rx: &mpsc::Receiver<ServerEvent>,
) -> Result<(), BoxError> {
    loop {
        if let Some(text) = websocket::read_text(sock)? {
            match ClientEvent::from_string(&text) {
                Ok(ClientEvent::SyncRequest { client_time }) => {
                    websocket::send_json(sock, &sync_reply(client_time))?;
                }
                Ok(event) => cmd_tx.send(AuthorityCommand::Event { conn, event })?,
                Err(e) => {
                    debug!("connection {} sent garbage: {}", conn, e);
                    cmd_tx.send(AuthorityCommand::Malformed { conn })?;
                }
            }
        }
        for event in out_rx.try_iter() {
            websocket::send_json(sock, &event)?;
        }
        sock.write_pending()?;
    }
}

/// Serve one client until its socket closes.
pub fn connection_thread(
    stream: TcpStream,
    conn: ConnectionId,
    cmd_tx: mpsc::Sender<AuthorityCommand>,
) -> Result<(), BoxError> {
    let peer = stream.peer_addr()?;
    let mut sock = websocket::accept(stream)?;
    let (out_tx, out_rx) = mpsc::channel();
    cmd_tx.send(AuthorityCommand::Connected { conn, tx: out_tx })?;
    info!("connection {} from {}", conn, peer);
    let result = pump(&mut sock, conn, &cmd_tx, &out_rx);
    // the disconnect goes out on the same channel, after every event
    let _res = cmd_tx.send(AuthorityCommand::Disconnected { conn });
    let _res = sock.close(None);
    info!("connection {} gone", conn);
    result
}

pub struct SyncServer {
    listener: TcpListener,
    cmd_tx: mpsc::Sender<AuthorityCommand>,
    _authority: JoinHandle<()>,
    _reaper: PeriodicTask,
    next_conn: ConnectionId,
}

impl SyncServer {
    /// Bind the listen address and start the authority and reaper threads.
    pub fn bind(settings: &ServerSettings) -> Result<SyncServer, BoxError> {
        let listener = TcpListener::bind(settings.listen_addr.as_str())?;
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let adapter = SessionProtocolAdapter::new(settings);
        let authority = thread::Builder::new()
            .name("authority".to_string())
            .spawn(move || authority_thread(adapter, cmd_rx))?;
        let sweep_tx = cmd_tx.clone();
        let reaper = PeriodicTask::spawn("reaper", settings.sweep_interval, move || {
            sweep_tx.send(AuthorityCommand::Sweep).is_ok()
        })?;
        info!(
            "listening on {}, max {} per session, idle timeout {:?}",
            listener.local_addr()?,
            settings.max_members,
            settings.idle_timeout
        );
        Ok(SyncServer {
            listener,
            cmd_tx,
            _authority: authority,
            _reaper: reaper,
            next_conn: 1,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BoxError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub fn serve(mut self) -> Result<(), BoxError> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let conn = self.next_conn;
            self.next_conn += 1;
            let cmd_tx = self.cmd_tx.clone();
            thread::Builder::new()
                .name(format!("conn-{}", conn))
                .spawn(move || {
                    if let Err(e) = connection_thread(stream, conn, cmd_tx) {
                        debug!("connection {} ended: {}", conn, e);
                    }
                })?;
        }
        Ok(())
    }
}

/// Bind and serve with `settings`.  Only returns on a fatal error.
pub fn run(settings: &ServerSettings) -> Result<(), BoxError> {
    SyncServer::bind(settings)?.serve()
}
