//! Polling helpers around a blocking tungstenite socket.
//!
//! Sockets get a short read timeout so one thread can alternate between
//! reading the peer and draining its outgoing channel.  A read that times out
//! is not an error, it just means there was nothing to read.
use log::{debug, trace};
use serde::Serialize;
use simple_error::bail;
use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};
use tungstenite::{
    client::{self, IntoClientRequest},
    error::{Error, UrlError},
    http::Uri,
    stream::{Mode, NoDelay},
    Message, WebSocket,
};
use url::Url;

use crate::common::box_error::BoxError;

/// How long a read waits before giving the thread back.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Read one text frame.
///
/// `Ok(None)` when nothing arrived within the read timeout or the frame was a
/// control frame.  An error means the connection is done.
pub fn read_text<S: Read + Write>(sock: &mut WebSocket<S>) -> Result<Option<String>, BoxError> {
    match sock.read_message() {
        Ok(Message::Text(text)) => Ok(Some(text)),
        Ok(Message::Binary(data)) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
        Ok(Message::Close(frame)) => {
            debug!("peer closed: {:?}", frame);
            bail!("connection closed by peer")
        }
        Ok(other) => {
            trace!("control frame {:?}", other);
            Ok(None)
        }
        Err(Error::Io(e)) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Serialize `event` and write it as one text frame.
pub fn send_json<S: Read + Write, T: Serialize>(
    sock: &mut WebSocket<S>,
    event: &T,
) -> Result<(), BoxError> {
    let text = serde_json::to_string(event)?;
    sock.write_message(Message::Text(text))?;
    Ok(())
}

/// Open a websocket to `url` with the polling read timeout already set.
pub fn connect(url: &str) -> Result<WebSocket<TcpStream>, BoxError> {
    let stream = make_stream(url)?;
    let (sock, _resp) = client::client(Url::parse(url)?, stream)
        .map_err(|e| format!("handshake with {} failed: {}", url, e))?;
    Ok(sock)
}

fn make_stream(url: &str) -> Result<TcpStream, BoxError> {
    let url = Url::parse(url)?;
    let request = url.into_client_request()?;
    let uri = request.uri();
    let mode = client::uri_mode(uri)?;
    let host = uri.host().ok_or(Error::Url(UrlError::NoHostName))?;
    let port = uri.port_u16().unwrap_or(match mode {
        Mode::Plain => 80,
        Mode::Tls => 443,
    });
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let mut stream = connect_to_some(&addrs, uri)?;
    NoDelay::set_nodelay(&mut stream, true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(stream)
}

fn connect_to_some(addrs: &[SocketAddr], uri: &Uri) -> Result<TcpStream, Error> {
    for addr in addrs {
        debug!("trying {} at {}", uri, addr);
        if let Ok(stream) = TcpStream::connect(addr) {
            return Ok(stream);
        }
    }
    Err(Error::Url(UrlError::UnableToConnect(uri.to_string())))
}

/// Server side of the handshake on an accepted stream.
pub fn accept(stream: TcpStream) -> Result<WebSocket<TcpStream>, BoxError> {
    stream.set_nodelay(true)?;
    let sock = tungstenite::accept(stream).map_err(|e| format!("handshake failed: {}", e))?;
    // the handshake itself must not see the timeout
    sock.get_ref().set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(sock)
}

#[cfg(test)]
mod test_websocket {
    use super::*;
    use std::{net::TcpListener, thread};

    #[test]
    fn connect_to_nothing_fails() {
        // port 9 on localhost is almost never listening
        assert!(connect("ws://127.0.0.1:9").is_err());
        assert!(connect("not a url").is_err());
    }

    #[test]
    fn text_frames_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut sock = accept(stream).unwrap();
            let mut got = None;
            for _ in 0..250 {
                if let Some(text) = read_text(&mut sock).unwrap() {
                    got = Some(text);
                    break;
                }
            }
            send_json(&mut sock, &serde_json::json!({"echo": got})).unwrap();
            // let the client read before the socket goes away
            for _ in 0..50 {
                if read_text(&mut sock).is_err() {
                    break;
                }
            }
        });
        let mut sock = connect(&format!("ws://{}", addr)).unwrap();
        send_json(&mut sock, &"hello").unwrap();
        let mut reply = None;
        for _ in 0..250 {
            if let Some(text) = read_text(&mut sock).unwrap() {
                reply = Some(text);
                break;
            }
        }
        assert_eq!(reply.unwrap(), r#"{"echo":"\"hello\""}"#);
        drop(sock);
        server.join().unwrap();
    }
}
