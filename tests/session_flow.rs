use std::{
    net::TcpStream,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use beatsync::{
    client::metronome_client::{self, UserCommand},
    common::{
        config::{ClientSettings, ServerSettings},
        event_message::{ClientEvent, ServerEvent, SessionSnapshot},
        websocket,
    },
    server::sync_server::SyncServer,
};
use tungstenite::{Message, WebSocket};

fn start_server() -> String {
    let settings = ServerSettings {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let server = SyncServer::bind(&settings).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve());
    format!("ws://{}", addr)
}

fn recv(sock: &mut WebSocket<TcpStream>) -> ServerEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(text) = websocket::read_text(sock).unwrap() {
            return ServerEvent::from_string(&text).unwrap();
        }
    }
    panic!("no event within 5 seconds");
}

fn send(sock: &mut WebSocket<TcpStream>, event: ClientEvent) {
    websocket::send_json(sock, &event).unwrap();
}

fn snapshot(event: ServerEvent) -> SessionSnapshot {
    match event {
        ServerEvent::SessionCreated(s) | ServerEvent::SessionJoined(s) => s,
        other => panic!("expected a snapshot, got {:?}", other),
    }
}

#[test]
fn two_musicians_share_a_grid() {
    let url = start_server();
    let mut ada = websocket::connect(&url).unwrap();
    let mut grace = websocket::connect(&url).unwrap();

    send(
        &mut ada,
        ClientEvent::CreateSession {
            name: "Ada".to_string(),
        },
    );
    let created = snapshot(recv(&mut ada));
    assert!(created.is_host);
    assert_eq!(created.code.len(), 6);
    let ada_id = created.members[0].connection_id;

    send(
        &mut grace,
        ClientEvent::JoinSession {
            code: created.code.to_lowercase(),
            name: "Grace".to_string(),
        },
    );
    let joined = snapshot(recv(&mut grace));
    assert!(!joined.is_host);
    assert_eq!(joined.code, created.code);
    assert_eq!(joined.members.len(), 2);
    match recv(&mut ada) {
        ServerEvent::MemberJoined { member } => assert_eq!(member.name, "Grace"),
        other => panic!("unexpected {:?}", other),
    }

    // only the host runs the metronome
    send(&mut grace, ClientEvent::StartTiming);
    assert_eq!(
        recv(&mut grace),
        ServerEvent::error("Only the host can perform this action")
    );

    send(&mut ada, ClientEvent::StartTiming);
    let started = recv(&mut ada);
    assert_eq!(recv(&mut grace), started);
    let epoch = match started {
        ServerEvent::TimingStarted {
            epoch_start, bpm, ..
        } => {
            assert_eq!(bpm, 120);
            epoch_start
        }
        other => panic!("unexpected {:?}", other),
    };

    send(&mut grace, ClientEvent::SyncRequest { client_time: 42 });
    match recv(&mut grace) {
        ServerEvent::SyncResponse {
            client_time,
            authority_time,
        } => {
            assert_eq!(client_time, 42);
            assert!(authority_time >= epoch);
        }
        other => panic!("unexpected {:?}", other),
    }

    send(&mut ada, ClientEvent::SetTempo { bpm: 90 });
    for sock in [&mut ada, &mut grace] {
        match recv(sock) {
            ServerEvent::TimingUpdated(t) => {
                assert_eq!(t.bpm, 90);
                assert_eq!(t.epoch_start, Some(epoch));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    grace
        .write_message(Message::Text("{not json".to_string()))
        .unwrap();
    assert_eq!(recv(&mut grace), ServerEvent::error("Malformed event"));

    // the host walks away, Grace takes over
    drop(ada);
    assert_eq!(
        recv(&mut grace),
        ServerEvent::MemberLeft {
            connection_id: ada_id
        }
    );
    send(&mut grace, ClientEvent::StopTiming);
    assert_eq!(recv(&mut grace), ServerEvent::TimingStopped {});
}

#[test]
fn full_session_rejects_newcomers() {
    let settings = ServerSettings {
        listen_addr: "127.0.0.1:0".to_string(),
        max_members: 1,
        ..Default::default()
    };
    let server = SyncServer::bind(&settings).unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    thread::spawn(move || server.serve());

    let mut ada = websocket::connect(&url).unwrap();
    send(
        &mut ada,
        ClientEvent::CreateSession {
            name: "Ada".to_string(),
        },
    );
    let code = snapshot(recv(&mut ada)).code;

    let mut grace = websocket::connect(&url).unwrap();
    send(
        &mut grace,
        ClientEvent::JoinSession {
            code,
            name: "Grace".to_string(),
        },
    );
    assert_eq!(recv(&mut grace), ServerEvent::error("Session is full"));
}

#[test]
fn client_runtime_follows_the_host() {
    let url = start_server();
    let client_settings = ClientSettings {
        server_url: url.clone(),
        sync_interval: Duration::from_millis(50),
        lookahead: Duration::from_millis(5),
        schedule_ahead: Duration::from_millis(100),
        manual_trim_ms: 0.0,
    };

    let mut host = websocket::connect(&url).unwrap();
    send(
        &mut host,
        ClientEvent::CreateSession {
            name: "Ada".to_string(),
        },
    );
    let code = snapshot(recv(&mut host)).code;
    send(&mut host, ClientEvent::SetTempo { bpm: 300 });
    let _updated = recv(&mut host);
    send(&mut host, ClientEvent::StartTiming);
    let _started = recv(&mut host);

    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (pulse_tx, pulse_rx) = mpsc::channel();
    let client = thread::spawn(move || metronome_client::run(client_settings, cmd_rx, pulse_tx));
    cmd_tx
        .send(UserCommand::Join {
            code,
            name: "Grace".to_string(),
        })
        .unwrap();

    let pulse = pulse_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(pulse.index >= 1);

    drop(cmd_tx);
    assert!(client.join().unwrap().is_ok());
}
