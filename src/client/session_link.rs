//! Thread used to read/write events to/from the session server.
//!
//! The link keeps reconnecting until its owner goes away.  Whatever the owner
//! queued while the socket was down is thrown away on reconnect, those events
//! refer to a connection the server has already forgotten.
//!
//! A sync request is stamped again right before it is written, so the time it
//! carries does not include the wait in the outgoing queue.
use log::{debug, info, warn};
use std::{
    net::TcpStream,
    sync::mpsc::{self, TryRecvError},
    thread::{self, sleep, JoinHandle},
    time::Duration,
};
use tungstenite::WebSocket;

use crate::common::{
    box_error::BoxError,
    event_message::{ClientEvent, ServerEvent},
    get_milli_time, websocket,
};

use super::clock_sync::ClockSyncEstimator;

/// What the link reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Event(ServerEvent),
    Disconnected,
}

/// `event` as it should leave at local time `now`.
fn stamp(event: ClientEvent, now: i64) -> ClientEvent {
    match event {
        ClientEvent::SyncRequest { .. } => ClockSyncEstimator::request(now),
        other => other,
    }
}

enum PumpEnd {
    // socket failed, try again
    Dropped,
    // owner is gone, stop for good
    Shutdown,
}

fn pump(
    sock: &mut WebSocket<TcpStream>,
    up_tx: &mpsc::Sender<LinkEvent>,
    down_rx: &mpsc::Receiver<ClientEvent>,
) -> PumpEnd {
    loop {
        match websocket::read_text(sock) {
            Ok(Some(text)) => match ServerEvent::from_string(&text) {
                Ok(event) => {
                    if up_tx.send(LinkEvent::Event(event)).is_err() {
                        return PumpEnd::Shutdown;
                    }
                }
                Err(e) => warn!("unreadable event from server: {} ({})", text, e),
            },
            Ok(None) => {}
            Err(e) => {
                info!("link dropped: {}", e);
                return PumpEnd::Dropped;
            }
        }
        loop {
            match down_rx.try_recv() {
                Ok(event) => {
                    let event = stamp(event, get_milli_time());
                    if let Err(e) = websocket::send_json(sock, &event) {
                        info!("link dropped on write: {}", e);
                        return PumpEnd::Dropped;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return PumpEnd::Shutdown,
            }
        }
        if let Err(e) = sock.write_pending() {
            info!("link dropped on flush: {}", e);
            return PumpEnd::Dropped;
        }
    }
}

/// Run the link to `ws_url`.  Returns when the owner drops either channel end.
pub fn link_thread(
    ws_url: &str,
    retry_delay: Duration,
    up_tx: mpsc::Sender<LinkEvent>,
    down_rx: mpsc::Receiver<ClientEvent>,
) -> Result<(), BoxError> {
    info!("link to {}", ws_url);
    loop {
        match websocket::connect(ws_url) {
            Ok(mut sock) => {
                // stale requests from before the drop
                let stale = down_rx.try_iter().count();
                if stale > 0 {
                    debug!("discarded {} queued events", stale);
                }
                up_tx.send(LinkEvent::Connected)?;
                let end = pump(&mut sock, &up_tx, &down_rx);
                let _res = sock.close(None);
                match end {
                    PumpEnd::Shutdown => return Ok(()),
                    PumpEnd::Dropped => up_tx.send(LinkEvent::Disconnected)?,
                }
            }
            Err(e) => debug!("connect to {} failed: {}", ws_url, e),
        }
        sleep(retry_delay);
    }
}

/// Handle on a running link thread.
pub struct SessionLink {
    pub tx: mpsc::Sender<ClientEvent>,
    pub rx: mpsc::Receiver<LinkEvent>,
    _handle: JoinHandle<()>,
}

impl SessionLink {
    pub fn open(ws_url: &str, retry_delay: Duration) -> Result<SessionLink, BoxError> {
        let (down_tx, down_rx) = mpsc::channel();
        let (up_tx, up_rx) = mpsc::channel();
        let url = ws_url.to_string();
        let handle = thread::Builder::new()
            .name("session-link".to_string())
            .spawn(move || {
                if let Err(e) = link_thread(&url, retry_delay, up_tx, down_rx) {
                    debug!("link thread ended: {}", e);
                }
            })?;
        Ok(SessionLink {
            tx: down_tx,
            rx: up_rx,
            _handle: handle,
        })
    }
}
