//! Client transport thread: drives the connection state machine and the
//! receive loop on a single non-blocking socket.

use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::net::TcpStream as MioStream;
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::framing::Framer;
use crate::logging;
use crate::shared::{HalResult, READ_BUFFER_SIZE};

use super::ClientCore;

/// Readiness deadline for one receive wait.
const RECEIVE_WAIT: Duration = Duration::from_millis(250);
/// Pause before retrying a connection the server is not yet accepting.
const CONNECT_RETRY_PAUSE: Duration = Duration::from_secs(1);
const CLIENT_TOKEN: Token = Token(0);

enum SocketState {
    Init,
    Connect,
    Receive,
}

enum ReceiveOutcome {
    Continue,
    Disconnected,
}

/// One established connection: the registered socket and its framer.
struct Session {
    poll: Poll,
    events: Events,
    stream: MioStream,
    framer: Framer,
}

impl Session {
    fn establish(stream: TcpStream, core: &ClientCore) -> io::Result<Session> {
        let writer = stream.try_clone()?;
        stream.set_nonblocking(true)?;

        let stream = MioStream::from_stream(stream)?;
        let poll = Poll::new()?;
        poll.register(&stream, CLIENT_TOKEN, Ready::readable(), PollOpt::level())?;

        core.install_writer(writer);

        Ok(Session {
            poll,
            events: Events::with_capacity(4),
            stream,
            framer: Framer::new(),
        })
    }
}

pub(super) fn spawn(core: Arc<ClientCore>) -> HalResult<()> {
    thread::Builder::new()
        .name("halbus-client".to_owned())
        .spawn(move || run(core))
        .map(drop)
        .map_err(Into::into)
}

fn run(core: Arc<ClientCore>) {
    core.thread_running.store(true, Ordering::SeqCst);

    let addr = SocketAddr::from(([127, 0, 0, 1], core.config.port));
    let mut state = SocketState::Init;
    let mut session: Option<Session> = None;

    while core.running.load(Ordering::SeqCst) {
        match state {
            SocketState::Init => {
                session = None;
                state = SocketState::Connect;
            }
            SocketState::Connect => match TcpStream::connect(addr) {
                Ok(stream) => match Session::establish(stream, &core) {
                    Ok(established) => {
                        session = Some(established);
                        state = SocketState::Receive;
                        core.on_connected();
                    }
                    Err(err) => {
                        logging::error!(core.log, "failed to set up connection";
                                        "context" => "connect",
                                        "error" => %err);
                        state = SocketState::Init;
                    }
                },
                Err(err) => match err.kind() {
                    // Server not up (yet): try again shortly.
                    ErrorKind::ConnectionRefused
                    | ErrorKind::TimedOut
                    | ErrorKind::WouldBlock
                    | ErrorKind::Interrupted => {
                        thread::sleep(CONNECT_RETRY_PAUSE);
                    }
                    // Unusable address or socket: rebuild from scratch.
                    kind => {
                        logging::error!(core.log, "connect failed";
                                        "context" => "connect",
                                        "kind" => ?kind);
                        state = SocketState::Init;
                    }
                },
            },
            SocketState::Receive => {
                let outcome = match session.as_mut() {
                    Some(session) => receive_once(session, &core),
                    None => ReceiveOutcome::Disconnected,
                };
                if let ReceiveOutcome::Disconnected = outcome {
                    core.on_disconnected();
                    session = None;
                    state = SocketState::Init;
                }
            }
        }

        core.on_idle();
    }

    if session.take().is_some() {
        core.on_disconnected();
    }
    core.thread_running.store(false, Ordering::SeqCst);
    logging::debug!(core.log, "transport thread exiting"; "context" => "run");
}

/// One bounded readiness wait plus at most one read.
fn receive_once(session: &mut Session, core: &ClientCore) -> ReceiveOutcome {
    match session.poll.poll(&mut session.events, Some(RECEIVE_WAIT)) {
        Ok(_) => (),
        Err(err) => {
            logging::error!(core.log, "poll failed"; "context" => "receive", "error" => %err);
            return ReceiveOutcome::Continue;
        }
    }

    let readable = session
        .events
        .iter()
        .any(|event| event.token() == CLIENT_TOKEN && event.readiness().is_readable());
    if !readable {
        return ReceiveOutcome::Continue;
    }

    let mut buffer = [0u8; READ_BUFFER_SIZE];
    match session.stream.read(&mut buffer) {
        Ok(0) => ReceiveOutcome::Disconnected,
        Ok(count) => {
            core.handle_buffer(&mut session.framer, &buffer[..count]);
            ReceiveOutcome::Continue
        }
        Err(ref err) if err.kind() == ErrorKind::WouldBlock => ReceiveOutcome::Continue,
        Err(err) => {
            logging::error!(core.log, "recv failed"; "context" => "receive", "error" => %err);
            ReceiveOutcome::Continue
        }
    }
}
