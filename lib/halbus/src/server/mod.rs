//! Server half of the bus: accepts manager connections, dispatches inbound
//! requests to registered action handlers, and publishes events to
//! subscribers.

mod dispatch;
mod subscriptions;
mod transport;

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use hashbrown::HashMap;

use crate::config::HalConfig;
use crate::logging;
use crate::message::Envelope;
use crate::shared::{self, HalError, HalResult, SEQ_START};

use self::subscriptions::SubscriptionRegistry;

/// Identifier of one accepted connection, stable for its lifetime.
pub(crate) type ConnId = usize;

/// Handler registered for one action. Receives the decoded request, the
/// number of request params, and the reply skeleton to fill in.
pub type ActionHandler =
    Box<dyn Fn(&Envelope, usize, &mut Envelope) -> HalResult<()> + Send + Sync>;

/// Opt-in reply validation seam: a pure predicate over the serialized reply.
pub type ReplyValidator = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Iterations of the ~2 ms termination wait before giving up on the
/// listener thread.
const TERMINATE_WAIT_ROUNDS: u32 = 2000;

/// Write side of one connection, shared between the I/O thread and
/// publishers. The mutex keeps two envelopes from interleaving bytes.
pub(crate) struct ConnWriter {
    stream: Mutex<TcpStream>,
}

impl ConnWriter {
    fn new(stream: TcpStream) -> ConnWriter {
        ConnWriter {
            stream: Mutex::new(stream),
        }
    }

    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().unwrap();
        shared::send_all(&mut *stream, bytes)
    }
}

pub(crate) struct ServerCore {
    pub(crate) config: HalConfig,
    pub(crate) log: logging::Logger,
    pub(crate) running: AtomicBool,
    pub(crate) thread_running: AtomicBool,
    pub(crate) handlers: RwLock<HashMap<String, ActionHandler>>,
    pub(crate) subscriptions: SubscriptionRegistry,
    writers: Mutex<HashMap<ConnId, Arc<ConnWriter>>>,
    pub(crate) sequence: AtomicU32,
    validator: RwLock<Option<ReplyValidator>>,
}

impl ServerCore {
    fn new(config: HalConfig, log: logging::Logger) -> ServerCore {
        let registry_log = log.new(logging::o!("subsystem" => "subscriptions"));
        ServerCore {
            config,
            log,
            running: AtomicBool::new(false),
            thread_running: AtomicBool::new(false),
            handlers: RwLock::new(HashMap::new()),
            subscriptions: SubscriptionRegistry::new(registry_log),
            writers: Mutex::new(HashMap::new()),
            sequence: AtomicU32::new(SEQ_START),
            validator: RwLock::new(None),
        }
    }

    pub(crate) fn install_writer(&self, conn: ConnId, stream: TcpStream) {
        self.writers
            .lock()
            .unwrap()
            .insert(conn, Arc::new(ConnWriter::new(stream)));
    }

    fn writer(&self, conn: ConnId) -> Option<Arc<ConnWriter>> {
        self.writers.lock().unwrap().get(&conn).map(Arc::clone)
    }

    /// Sends one envelope's bytes to a connection. Failures are reported to
    /// the caller; the connection itself stays open.
    pub(crate) fn send_to(&self, conn: ConnId, bytes: &[u8]) -> HalResult<()> {
        let writer = self
            .writer(conn)
            .ok_or(HalError::Transport(io::ErrorKind::NotConnected))?;

        writer.send(bytes).map_err(|err| {
            logging::error!(self.log, "send failed";
                            "context" => "send_to",
                            "conn" => conn,
                            "bytes" => bytes.len(),
                            "error" => %err);
            HalError::from(err)
        })
    }

    /// Tears down the bookkeeping for a departed connection.
    pub(crate) fn drop_connection(&self, conn: ConnId) {
        self.writers.lock().unwrap().remove(&conn);
        self.subscriptions.remove_connection(conn);
        logging::info!(self.log, "client disconnected"; "conn" => conn);
    }

    pub(crate) fn validate_reply(&self, bytes: &[u8]) -> bool {
        let guard = self.validator.read().unwrap();
        match guard.as_ref() {
            Some(validate) => std::str::from_utf8(bytes).map(|text| validate(text)).unwrap_or(false),
            None => true,
        }
    }
}

/// Handle to the server endpoint. All state lives behind the handle; the
/// endpoint owns one detached listener thread after `run`.
pub struct HalServer {
    core: Arc<ServerCore>,
}

impl HalServer {
    /// Loads the configuration (and the schema header it points at) and
    /// builds the endpoint.
    pub fn init<'a, L: Into<Option<&'a logging::Logger>>>(
        conf_path: &str,
        log: L,
    ) -> HalResult<HalServer> {
        let config = HalConfig::load(conf_path)?;
        Ok(HalServer::init_with_config(config, log))
    }

    /// Builds the endpoint from an already assembled configuration.
    pub fn init_with_config<'a, L: Into<Option<&'a logging::Logger>>>(
        config: HalConfig,
        log: L,
    ) -> HalServer {
        let log = logging::component(log, "hal-server");
        HalServer {
            core: Arc::new(ServerCore::new(config, log)),
        }
    }

    /// Registers the handler invoked for `action_name`. Registration happens
    /// during init, before `run`; a duplicate name is refused.
    pub fn register_action<F>(&self, action_name: &str, handler: F) -> HalResult<()>
    where
        F: Fn(&Envelope, usize, &mut Envelope) -> HalResult<()> + Send + Sync + 'static,
    {
        let mut handlers = self.core.handlers.write().unwrap();
        if handlers.contains_key(action_name) {
            logging::info!(self.core.log, "action already registered"; "action" => action_name);
            return Err(HalError::AlreadyRegistered(action_name.to_owned()));
        }

        handlers.insert(action_name.to_owned(), Box::new(handler));
        Ok(())
    }

    /// Installs the opt-in reply validator. Replies failing it are replaced
    /// with a `Not Supported` envelope.
    pub fn set_reply_validator<F>(&self, validate: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.core.validator.write().unwrap() = Some(Box::new(validate));
    }

    /// Starts the detached listener thread. A second call is a no-op.
    pub fn run(&self) -> HalResult<()> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        transport::spawn(Arc::clone(&self.core)).map_err(|err| {
            self.core.running.store(false, Ordering::SeqCst);
            err
        })
    }

    /// Publishes `event_value` under `event_name` to every subscriber.
    /// Blocks until synchronous subscribers acknowledge (or the 10 s
    /// ceiling passes for the timeout mode).
    pub fn publish_event(&self, event_name: &str, event_value: &str) -> HalResult<()> {
        subscriptions::publish(&self.core, event_name, event_value)
    }

    /// Stops the listener thread and drains the registries.
    pub fn terminate(&self) -> HalResult<()> {
        self.core.running.store(false, Ordering::SeqCst);

        let mut rounds = TERMINATE_WAIT_ROUNDS;
        while rounds > 0 && self.core.thread_running.load(Ordering::SeqCst) {
            thread::sleep(self.core.config.request_timeout);
            rounds -= 1;
        }
        if self.core.thread_running.load(Ordering::SeqCst) {
            logging::warn!(self.core.log, "listener thread did not stop in time"; "context" => "terminate");
        } else {
            logging::info!(self.core.log, "listener thread terminated gracefully"; "context" => "terminate");
        }

        self.core.handlers.write().unwrap().clear();
        self.core.subscriptions.clear();
        self.core.writers.lock().unwrap().clear();
        *self.core.validator.write().unwrap() = None;
        Ok(())
    }

    /// The configuration this endpoint was initialised with.
    pub fn config(&self) -> &HalConfig {
        &self.core.config
    }
}
