//! Integration tests for milterwire.
//!
//! These drive whole sessions the way an MTA would: raw frames in, reply
//! frames out.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use milterwire::protocol::{actions, command, encode_frame, parse_packet, protocol, OptNeg};
use milterwire::session::{
    Connect, Envelope, Family, Flow, Header, MacroDict, Milter, Modifier, Reply, Session,
};
use milterwire::{Server, SessionConfig};

#[derive(Debug, Default)]
struct Calls {
    events: Vec<String>,
    mail_macros: Option<MacroDict>,
    closes: usize,
}

/// Records every callback; tags messages at end of body.
struct Recorder {
    calls: Arc<Mutex<Calls>>,
}

fn recorder() -> (Recorder, Arc<Mutex<Calls>>) {
    let calls = Arc::new(Mutex::new(Calls::default()));
    (
        Recorder {
            calls: calls.clone(),
        },
        calls,
    )
}

impl Recorder {
    fn event(&self, event: String) {
        self.calls.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl Milter for Recorder {
    async fn connect(&mut self, connect: Connect, _macros: &MacroDict) -> Reply {
        self.event(format!(
            "connect {} {:?} {}",
            String::from_utf8_lossy(&connect.hostname),
            connect.family,
            connect.port
        ));
        Reply::Continue
    }

    async fn helo(&mut self, helo: Bytes, _macros: &MacroDict) -> Reply {
        self.event(format!("helo {}", String::from_utf8_lossy(&helo)));
        Reply::Continue
    }

    async fn mail_from(&mut self, sender: Envelope, macros: &MacroDict) -> Reply {
        self.event(format!("mail {}", String::from_utf8_lossy(&sender.address)));
        self.calls.lock().unwrap().mail_macros = Some(macros.clone());
        Reply::Continue
    }

    async fn rcpt(&mut self, recipient: Envelope, _macros: &MacroDict) -> Reply {
        if recipient.address.starts_with(b"<blocked") {
            return Reply::custom(550, "", "no such user");
        }
        self.event(format!("rcpt {}", String::from_utf8_lossy(&recipient.address)));
        Reply::Continue
    }

    async fn header(&mut self, header: Header, _macros: &MacroDict) -> Reply {
        self.event(format!(
            "header {}: {}",
            String::from_utf8_lossy(&header.name),
            String::from_utf8_lossy(&header.value)
        ));
        Reply::Continue
    }

    async fn eoh(&mut self, _macros: &MacroDict) -> Reply {
        self.event("eoh".to_string());
        Reply::Continue
    }

    async fn body(&mut self, chunk: Bytes, _macros: &MacroDict) -> Reply {
        self.event(format!("body {}", chunk.len()));
        Reply::Continue
    }

    async fn eob(&mut self, modifier: &mut Modifier<'_>, _macros: &MacroDict) -> Reply {
        self.event(format!("eob {}", modifier.qid().unwrap_or("-")));
        modifier.add_header("X-Filtered", "yes").await;
        Reply::Accept
    }

    async fn close(&mut self) {
        self.calls.lock().unwrap().closes += 1;
    }
}

fn frame(code: u8, fields: &[&[u8]]) -> Vec<u8> {
    encode_frame(code, fields).to_vec()
}

fn optneg_frame(actions: u32, protocol: u32) -> Vec<u8> {
    OptNeg::new(6, actions, protocol).encode().to_vec()
}

fn new_session(config: &SessionConfig) -> (Session<Recorder>, Arc<Mutex<Calls>>, DuplexStream) {
    let (milter, calls) = recorder();
    let (milter_side, mta_side) = duplex(1 << 20);
    (Session::new(milter, milter_side, config), calls, mta_side)
}

/// Close the session and collect every reply payload it wrote.
async fn written_replies(session: &mut Session<Recorder>, mut mta: DuplexStream) -> Vec<Bytes> {
    session.close().await;
    let mut buf = Vec::new();
    mta.read_to_end(&mut buf).await.unwrap();
    parse_packet(&buf).unwrap().commands
}

/// Read exactly one reply payload from the MTA side.
async fn read_reply<R: tokio::io::AsyncRead + Unpin>(mta: &mut R) -> Bytes {
    let mut len = [0u8; 4];
    mta.read_exact(&mut len).await.unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    mta.read_exact(&mut payload).await.unwrap();
    Bytes::from(payload)
}

/// One complete SMTP transaction as the MTA sends it.
fn transcript() -> Vec<u8> {
    let mut connect = b"mail.example.com\0".to_vec();
    connect.push(b'4');
    connect.extend_from_slice(&2525u16.to_be_bytes());
    connect.extend_from_slice(b"192.0.2.10\0");

    let mut bytes = optneg_frame(0x1ff, 0);
    bytes.extend(frame(command::CONNECT, &[&connect]));
    bytes.extend(frame(command::HELO, &[b"client.example\0"]));
    bytes.extend(frame(command::MACRO, &[b"M", b"i\0QID9\0"]));
    bytes.extend(frame(command::MAIL, &[b"<a@example.com>\0", b"SIZE=10\0"]));
    bytes.extend(frame(command::RCPT, &[b"<b@example.com>\0"]));
    bytes.extend(frame(command::RCPT, &[b"<blocked@example.com>\0"]));
    bytes.extend(frame(command::DATA, &[]));
    bytes.extend(frame(command::HEADER, &[b"Subject\0", b"hello\0"]));
    bytes.extend(frame(command::EOH, &[]));
    bytes.extend(frame(command::BODY, &[&[b'x'; 300]]));
    bytes.extend(frame(command::BODYEOB, &[]));
    bytes.extend(frame(command::QUIT, &[]));
    bytes
}

#[tokio::test]
async fn test_scenario_optneg_reply_uses_own_options() {
    let config = SessionConfig {
        actions: actions::ADDHDRS | actions::CHGHDRS,
        protocol: protocol::NOUNKNOWN,
        ..SessionConfig::default()
    };
    let (mut session, _calls, mta) = new_session(&config);
    assert!(session.negotiated().is_none());

    session.data_received(&optneg_frame(0, 0)).await.unwrap();

    let negotiated = session.negotiated().copied().unwrap();
    assert_eq!(negotiated.theirs, OptNeg::new(6, 0, 0));
    assert_eq!(negotiated.actions(), 0);

    let replies = written_replies(&mut session, mta).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0][0], command::OPTNEG);
    assert_eq!(
        OptNeg::decode(&replies[0][1..]).unwrap(),
        OptNeg::new(6, actions::ADDHDRS | actions::CHGHDRS, protocol::NOUNKNOWN)
    );
}

#[tokio::test]
async fn test_scenario_helo_split_mid_string() {
    let (mut session, calls, _mta) = new_session(&SessionConfig::default());
    let bytes = frame(command::HELO, &[b"example.com\0"]);
    let (first, second) = bytes.split_at(9);

    session.data_received(first).await.unwrap();
    assert!(calls.lock().unwrap().events.is_empty());

    session.data_received(second).await.unwrap();
    assert_eq!(calls.lock().unwrap().events, vec!["helo example.com".to_string()]);
}

#[tokio::test]
async fn test_scenario_macro_reaches_mail_from() {
    let (mut session, calls, _mta) = new_session(&SessionConfig::default());
    let mut bytes = frame(command::MACRO, &[b"Mi\0QID123\0"]);
    bytes.extend(frame(command::MAIL, &[b"<s@example.com>\0"]));

    session.data_received(&bytes).await.unwrap();

    let calls = calls.lock().unwrap();
    let macros = calls.mail_macros.as_ref().unwrap();
    assert_eq!(macros.get("i").map(String::as_str), Some("QID123"));
    assert_eq!(session.qid(), Some("QID123"));
}

#[tokio::test]
async fn test_scenario_quit_closes_once() {
    let (mut session, calls, mta) = new_session(&SessionConfig::default());
    let mut bytes = frame(command::QUIT, &[]);
    bytes.extend(frame(command::HELO, &[b"after-quit\0"]));

    let flow = session.data_received(&bytes).await.unwrap();
    assert_eq!(flow, Flow::Quit);

    session.connection_lost().await;
    session.close().await;

    {
        let calls = calls.lock().unwrap();
        assert!(calls.events.is_empty());
        assert_eq!(calls.closes, 1);
    }
    assert!(written_replies(&mut session, mta).await.is_empty());
}

/// Captures formatted log output.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct HeaderAdder;

#[async_trait]
impl Milter for HeaderAdder {
    async fn eob(&mut self, modifier: &mut Modifier<'_>, _macros: &MacroDict) -> Reply {
        modifier.add_header("X-Spam", "no").await;
        Reply::Continue
    }
}

#[tokio::test]
async fn test_scenario_add_header_without_option_is_noop() {
    let logs = LogCapture::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (milter_side, mut mta) = duplex(4096);
    let mut session = Session::new(HeaderAdder, milter_side, &SessionConfig::default());
    let mut bytes = optneg_frame(actions::QUARANTINE, 0);
    bytes.extend(frame(command::BODYEOB, &[]));

    session.data_received(&bytes).await.unwrap();
    session.close().await;

    let mut buf = Vec::new();
    mta.read_to_end(&mut buf).await.unwrap();
    let replies = parse_packet(&buf).unwrap().commands;
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0][0], command::OPTNEG);
    assert_eq!(&replies[1][..], b"c");

    let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("WARN"));
    assert!(output.contains("action not negotiated"));
    assert!(output.contains("ADDHDRS"));
}

async fn run_transcript(chunk_size: usize) -> (Vec<String>, Vec<Bytes>) {
    let (mut session, calls, mta) = new_session(&SessionConfig::default());
    let bytes = transcript();

    for chunk in bytes.chunks(chunk_size) {
        if session.data_received(chunk).await.unwrap() == Flow::Quit {
            break;
        }
    }

    let replies = written_replies(&mut session, mta).await;
    let events = calls.lock().unwrap().events.clone();
    (events, replies)
}

#[tokio::test]
async fn test_full_transaction() {
    let (events, replies) = run_transcript(usize::MAX).await;

    assert_eq!(
        events,
        vec![
            "connect mail.example.com Inet 2525",
            "helo client.example",
            "mail <a@example.com>",
            "rcpt <b@example.com>",
            "header Subject: hello",
            "eoh",
            "body 300",
            "eob QID9",
        ]
    );

    let codes: Vec<u8> = replies.iter().map(|r| r[0]).collect();
    // OPTNEG, connect, helo, mail, rcpt, rcpt (rejected), data, header, eoh,
    // body, then the header modification and the final verdict.
    assert_eq!(codes, b"Occccyccccha".to_vec());
    assert_eq!(&replies[5][..], b"y550 5.7.1 no such user\0");
    assert_eq!(&replies[10][..], b"hX-Filtered\0yes\0");
}

#[tokio::test]
async fn test_chunk_size_does_not_change_dispatch() {
    let expected = run_transcript(usize::MAX).await;

    for chunk_size in [1, 2, 3, 4, 5, 6, 7, 11, 64, 333] {
        assert_eq!(run_transcript(chunk_size).await, expected, "chunk size {}", chunk_size);
    }
}

#[tokio::test]
async fn test_no_callback_bits_skip_phases() {
    let config = SessionConfig {
        protocol: protocol::NOHELO | protocol::NR_HDR | protocol::NOEOH,
        ..SessionConfig::default()
    };
    let (mut session, calls, mta) = new_session(&config);
    let mut bytes = optneg_frame(0xff, 0x1f_ffff);
    bytes.extend(frame(command::HELO, &[b"skipped\0"]));
    bytes.extend(frame(command::HEADER, &[b"From\0", b"x\0"]));
    bytes.extend(frame(command::EOH, &[]));
    bytes.extend(frame(command::DATA, &[]));

    session.data_received(&bytes).await.unwrap();

    assert_eq!(calls.lock().unwrap().events, vec!["header From: x".to_string()]);
    let replies = written_replies(&mut session, mta).await;
    // OPTNEG reply and DATA's continue only.
    assert_eq!(replies.len(), 2);
    assert_eq!(&replies[1][..], b"c");
}

#[tokio::test]
async fn test_oversized_frame_is_fatal() {
    let config = SessionConfig {
        max_frame_size: 64,
        ..SessionConfig::default()
    };
    let (mut session, _calls, _mta) = new_session(&config);

    let result = session.data_received(&frame(command::BODY, &[&[0u8; 100]])).await;
    assert!(matches!(
        result,
        Err(milterwire::MilterError::FrameTooLarge { size: 101, max: 64 })
    ));
}

#[tokio::test]
async fn test_connect_unknown_family() {
    let (mut session, calls, _mta) = new_session(&SessionConfig::default());

    session
        .data_received(&frame(command::CONNECT, &[b"[unknown]\0U"]))
        .await
        .unwrap();

    assert_eq!(calls.lock().unwrap().events[0], format!("connect [unknown] {:?} 0", Family::Unknown));
}

#[tokio::test]
async fn test_live_session_replies_in_order() {
    let (milter, calls) = recorder();
    let (milter_side, mut mta) = duplex(64);
    let (reader, writer) = tokio::io::split(milter_side);
    let mut session = Session::new(milter, writer, &SessionConfig::default());
    let task = tokio::spawn(async move { session.run(reader).await });

    mta.write_all(&optneg_frame(actions::ADDHDRS, 0)).await.unwrap();
    let reply = read_reply(&mut mta).await;
    assert_eq!(reply[0], command::OPTNEG);

    mta.write_all(&frame(command::HELO, &[b"one\0"])).await.unwrap();
    assert_eq!(&read_reply(&mut mta).await[..], b"c");

    mta.write_all(&frame(command::BODYEOB, &[])).await.unwrap();
    assert_eq!(&read_reply(&mut mta).await[..], b"hX-Filtered\0yes\0");
    assert_eq!(&read_reply(&mut mta).await[..], b"a");

    mta.write_all(&frame(command::QUIT, &[])).await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(calls.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_server_over_tcp() {
    let server = Server::builder()
        .listen("inet:127.0.0.1:0")
        .actions(actions::ADDHDRS)
        .bind(|| recorder().0)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let port = match addr {
        milterwire::transport::ListenAddr::Inet { port, .. } => port,
        other => panic!("unexpected address {}", other),
    };

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_until(async {
        let _ = stop_rx.await;
    }));

    let mut mta = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    mta.write_all(&optneg_frame(0x1ff, 0)).await.unwrap();
    let reply = read_reply(&mut mta).await;
    assert_eq!(
        OptNeg::decode(&reply[1..]).unwrap(),
        OptNeg::new(6, actions::ADDHDRS, 0)
    );

    mta.write_all(&frame(command::QUIT, &[])).await.unwrap();
    let mut rest = Vec::new();
    mta.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_max_connections_limits_sessions() {
    let server = Server::builder()
        .listen("inet:127.0.0.1:0")
        .max_connections(1)
        .bind(|| recorder().0)
        .await
        .unwrap();
    let port = match server.local_addr().unwrap() {
        milterwire::transport::ListenAddr::Inet { port, .. } => port,
        other => panic!("unexpected address {}", other),
    };

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_until(async {
        let _ = stop_rx.await;
    }));

    let mut first = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    first.write_all(&optneg_frame(0x1ff, 0)).await.unwrap();
    assert_eq!(read_reply(&mut first).await[0], command::OPTNEG);

    // Connects through the kernel backlog but is not served yet.
    let mut second = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    second.write_all(&optneg_frame(0x1ff, 0)).await.unwrap();
    let waiting = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        read_reply(&mut second),
    )
    .await;
    assert!(waiting.is_err(), "second session served while the first was open");

    first.write_all(&frame(command::QUIT, &[])).await.unwrap();
    let mut rest = Vec::new();
    first.read_to_end(&mut rest).await.unwrap();

    let reply = tokio::time::timeout(std::time::Duration::from_secs(5), read_reply(&mut second))
        .await
        .unwrap();
    assert_eq!(reply[0], command::OPTNEG);

    second.write_all(&frame(command::QUIT, &[])).await.unwrap();
    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
}
