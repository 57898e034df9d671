//! Listener thread: owns the listen socket and every accepted connection,
//! multiplexing them with bounded readiness waits.

use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream as MioStream};
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::framing::Framer;
use crate::logging;
use crate::shared::{HalResult, READ_BUFFER_SIZE};

use super::{dispatch, ConnId, ServerCore};

const LISTEN_TOKEN: Token = Token(0);
/// Readiness deadline for one multiplexing wait.
const POLL_WAIT: Duration = Duration::from_millis(50);

struct Connection {
    id: ConnId,
    stream: MioStream,
    framer: Framer,
}

pub(super) fn spawn(core: Arc<ServerCore>) -> HalResult<()> {
    thread::Builder::new()
        .name("halbus-server".to_owned())
        .spawn(move || run(core))
        .map(drop)
        .map_err(Into::into)
}

fn run(core: Arc<ServerCore>) {
    core.thread_running.store(true, Ordering::SeqCst);

    let addr = SocketAddr::from(([127, 0, 0, 1], core.config.port));
    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(err) => {
            logging::crit!(core.log, "failed to bind"; "port" => core.config.port, "error" => %err);
            core.running.store(false, Ordering::SeqCst);
            core.thread_running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            logging::crit!(core.log, "failed to create poll"; "error" => %err);
            core.running.store(false, Ordering::SeqCst);
            core.thread_running.store(false, Ordering::SeqCst);
            return;
        }
    };
    if let Err(err) = poll.register(&listener, LISTEN_TOKEN, Ready::readable(), PollOpt::level()) {
        logging::crit!(core.log, "failed to register listener"; "error" => %err);
        core.running.store(false, Ordering::SeqCst);
        core.thread_running.store(false, Ordering::SeqCst);
        return;
    }

    let mut events = Events::with_capacity(64);
    // Insertion order is connection-arrival order.
    let mut connections: IndexMap<Token, Connection> = IndexMap::new();
    let mut next_id: ConnId = 1;

    logging::info!(core.log, "server listening"; "port" => core.config.port);

    while core.running.load(Ordering::SeqCst) {
        if let Err(err) = poll.poll(&mut events, Some(POLL_WAIT)) {
            logging::error!(core.log, "poll failed"; "error" => %err);
            break;
        }

        let ready: Vec<Token> = events.iter().map(|event| event.token()).collect();
        for token in ready {
            if token == LISTEN_TOKEN {
                accept_one(&core, &listener, &poll, &mut connections, &mut next_id);
            } else {
                read_connection(&core, &poll, &mut connections, token);
            }
        }
    }

    // Close every open descriptor on the way out.
    for (_, connection) in connections.drain(..) {
        let _ = poll.deregister(&connection.stream);
        logging::info!(core.log, "closing connection"; "conn" => connection.id);
    }
    core.thread_running.store(false, Ordering::SeqCst);
    logging::debug!(core.log, "listener thread exiting"; "context" => "run");
}

fn accept_one(
    core: &ServerCore,
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut IndexMap<Token, Connection>,
    next_id: &mut ConnId,
) {
    match listener.accept_std() {
        Ok((stream, peer)) => {
            let id = *next_id;
            *next_id += 1;

            let connection = match register_connection(core, poll, stream, id) {
                Ok(connection) => connection,
                Err(err) => {
                    logging::error!(core.log, "failed to register connection";
                                    "conn" => id,
                                    "error" => %err);
                    return;
                }
            };

            logging::info!(core.log, "client connected"; "conn" => id, "peer" => %peer);
            connections.insert(Token(id), connection);
        }
        Err(ref err) if err.kind() == ErrorKind::WouldBlock => (),
        Err(err) => {
            logging::error!(core.log, "accept failed"; "error" => %err);
        }
    }
}

fn register_connection(
    core: &ServerCore,
    poll: &Poll,
    stream: std::net::TcpStream,
    id: ConnId,
) -> std::io::Result<Connection> {
    let writer = stream.try_clone()?;
    stream.set_nonblocking(true)?;

    let stream = MioStream::from_stream(stream)?;
    poll.register(&stream, Token(id), Ready::readable(), PollOpt::level())?;

    core.install_writer(id, writer);

    Ok(Connection {
        id,
        stream,
        framer: Framer::new(),
    })
}

/// One read per wake; the level-triggered poll re-arms while data remains.
fn read_connection(
    core: &ServerCore,
    poll: &Poll,
    connections: &mut IndexMap<Token, Connection>,
    token: Token,
) {
    let closed = {
        let connection = match connections.get_mut(&token) {
            Some(connection) => connection,
            None => return,
        };

        let mut buffer = [0u8; READ_BUFFER_SIZE];
        match connection.stream.read(&mut buffer) {
            Ok(0) => true,
            Ok(count) => {
                dispatch::process_buffer(core, connection.id, &mut connection.framer, &buffer[..count]);
                false
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => false,
            Err(err) => {
                logging::error!(core.log, "recv failed";
                                "conn" => connection.id,
                                "error" => %err);
                false
            }
        }
    };

    if closed {
        if let Some(connection) = connections.shift_remove(&token) {
            let _ = poll.deregister(&connection.stream);
            core.drop_connection(connection.id);
        }
    }
}
