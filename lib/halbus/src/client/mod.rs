//! Client half of the bus: issues synchronous requests against the vendor
//! HAL and dispatches published events to subscribed callbacks.

mod pending;
mod transport;

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::config::HalConfig;
use crate::framing::{Frame, Framer};
use crate::logging;
use crate::message::{self, action, Envelope, NotificationMode, Status};
use crate::shared::{self, HalError, HalResult, SEQ_START};

use self::pending::PendingTable;

/// Callback invoked with the raw bytes of each matching event envelope.
pub type EventCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct EventSubscription {
    name: String,
    #[allow(dead_code)]
    mode: NotificationMode,
    callback: EventCallback,
}

/// Iterations of the ~2 ms termination wait before giving up on the I/O
/// thread (roughly four seconds, matching the transport loop granularity).
const TERMINATE_WAIT_ROUNDS: u32 = 2000;

pub(crate) struct ClientCore {
    pub(crate) config: HalConfig,
    pub(crate) log: logging::Logger,
    pub(crate) running: AtomicBool,
    pub(crate) thread_running: AtomicBool,
    connected: AtomicBool,
    writer: Mutex<Option<TcpStream>>,
    pending: PendingTable,
    subscriptions: Mutex<Vec<EventSubscription>>,
    sequence: AtomicU32,
}

impl ClientCore {
    fn new(config: HalConfig, log: logging::Logger) -> ClientCore {
        let pending_log = log.new(logging::o!("subsystem" => "pending"));
        ClientCore {
            config,
            log,
            running: AtomicBool::new(false),
            thread_running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            writer: Mutex::new(None),
            pending: PendingTable::new(pending_log),
            subscriptions: Mutex::new(Vec::new()),
            sequence: AtomicU32::new(SEQ_START),
        }
    }

    fn send(&self, bytes: &[u8]) -> HalResult<()> {
        let guard = self.writer.lock().unwrap();
        match guard.as_ref() {
            Some(mut stream) => shared::send_all(&mut stream, bytes).map_err(|err| {
                logging::error!(self.log, "send failed";
                                "context" => "send",
                                "bytes" => bytes.len(),
                                "error" => %err);
                HalError::from(err)
            }),
            None => Err(HalError::Transport(std::io::ErrorKind::NotConnected)),
        }
    }

    pub(crate) fn install_writer(&self, stream: TcpStream) {
        *self.writer.lock().unwrap() = Some(stream);
    }

    pub(crate) fn on_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        logging::info!(self.log, "connected to server"; "port" => self.config.port);
    }

    pub(crate) fn on_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().unwrap() = None;
        logging::info!(self.log, "disconnected from server"; "port" => self.config.port);
    }

    /// Idle hook run once per transport loop iteration.
    pub(crate) fn on_idle(&self) {
        self.pending.tick();
        thread::sleep(self.config.request_timeout);
    }

    pub(crate) fn handle_buffer(&self, framer: &mut Framer, chunk: &[u8]) {
        let (frames, err) = framer.push(chunk);
        if let Some(err) = err {
            logging::error!(self.log, "dropping rest of receive buffer";
                            "context" => "handle_buffer",
                            "error" => %err);
        }
        for frame in frames {
            self.route_frame(&frame);
        }
    }

    /// Routes one complete inbound value: events go to the subscription
    /// table, everything else is matched against the pending calls.
    fn route_frame(&self, frame: &Frame) {
        let envelope = match Envelope::from_value(&frame.value) {
            Ok(envelope) => envelope,
            Err(err) => {
                logging::debug!(self.log, "discarding undecodable frame";
                                "context" => "route_frame",
                                "error" => %err);
                return;
            }
        };

        match envelope.action() {
            Some(action::PUBLISH_EVENT) => self.dispatch_event(&envelope, &frame.raw),
            Some(_) => {
                let req_id = match envelope.req_id() {
                    Some(req_id) => req_id.canonical(),
                    None => {
                        logging::error!(self.log, "reply without reqId"; "context" => "route_frame");
                        return;
                    }
                };
                if !self.pending.complete(&req_id, &frame.raw) {
                    logging::error!(self.log, "no pending call for reply";
                                    "context" => "route_frame",
                                    "req_id" => req_id);
                }
            }
            None => (),
        }
    }

    fn dispatch_event(&self, envelope: &Envelope, raw: &[u8]) {
        let event_name = match envelope.first_param() {
            Some(param) => param.name.clone(),
            None => {
                logging::error!(self.log, "event without params"; "context" => "dispatch_event");
                return;
            }
        };

        // Snapshot the matching callbacks so none runs under the table lock.
        let callbacks: Vec<EventCallback> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .filter(|subscription| subscription.name == event_name)
                .map(|subscription| Arc::clone(&subscription.callback))
                .collect()
        };

        if callbacks.is_empty() {
            logging::error!(self.log, "no subscription for event";
                            "context" => "dispatch_event",
                            "event" => event_name);
            return;
        }

        logging::debug!(self.log, "dispatching event";
                        "context" => "dispatch_event",
                        "event" => event_name.as_str(),
                        "callbacks" => callbacks.len());

        for callback in callbacks {
            callback(raw);

            // An event carrying a reqId wants a synchronous acknowledgement
            // once the callback has run.
            if let Some(req_id) = envelope.req_id() {
                let ack = message::event_ack(
                    &self.config.module_name,
                    &self.config.module_version,
                    req_id,
                    &event_name,
                    Status::Success,
                );
                if self.send(&ack.to_wire()).is_err() {
                    logging::error!(self.log, "failed to acknowledge event";
                                    "context" => "dispatch_event",
                                    "event" => event_name.as_str());
                }
            }
        }
    }
}

/// Handle to the client endpoint. All state lives behind the handle; the
/// endpoint owns one detached I/O thread after `run`.
pub struct HalClient {
    core: Arc<ClientCore>,
}

impl HalClient {
    /// Loads the configuration (and the schema header it points at) and
    /// builds the endpoint.
    pub fn init<'a, L: Into<Option<&'a logging::Logger>>>(
        conf_path: &str,
        log: L,
    ) -> HalResult<HalClient> {
        let config = HalConfig::load(conf_path)?;
        Ok(HalClient::init_with_config(config, log))
    }

    /// Builds the endpoint from an already assembled configuration.
    pub fn init_with_config<'a, L: Into<Option<&'a logging::Logger>>>(
        config: HalConfig,
        log: L,
    ) -> HalClient {
        let log = logging::component(log, "hal-client");
        HalClient {
            core: Arc::new(ClientCore::new(config, log)),
        }
    }

    /// Starts the detached I/O thread. A second call is a no-op.
    pub fn run(&self) -> HalResult<()> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        transport::spawn(Arc::clone(&self.core)).map_err(|err| {
            self.core.running.store(false, Ordering::SeqCst);
            err
        })
    }

    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::SeqCst)
    }

    /// Mints a request envelope with a fresh reqId for the given action.
    pub fn request_header(&self, action_name: &str) -> Envelope {
        message::request_header(
            &self.core.config.module_name,
            &self.core.config.module_version,
            action_name,
            shared::next_seq(&self.core.sequence),
        )
    }

    /// Sends the request and blocks until the matching reply arrives or the
    /// call times out (nominally 10 s).
    pub fn send_and_wait(&self, request: &Envelope) -> HalResult<Envelope> {
        self.send_and_wait_with_ticker(request, pending::DEFAULT_TICKER)
    }

    /// Same as `send_and_wait` with a caller-chosen timeout in seconds.
    pub fn send_and_wait_with_timeout(
        &self,
        request: &Envelope,
        timeout_secs: u32,
    ) -> HalResult<Envelope> {
        let ticker = (timeout_secs.max(1) * 4) as i32;
        self.send_and_wait_with_ticker(request, ticker)
    }

    fn send_and_wait_with_ticker(&self, request: &Envelope, ticker: i32) -> HalResult<Envelope> {
        let req_id = request
            .req_id()
            .ok_or(HalError::InvalidArgument("request has no reqId"))?
            .canonical();

        let call = self.core.pending.register(&req_id, ticker);

        if let Err(err) = self.core.send(&request.to_wire()) {
            self.core.pending.discard(&call);
            return Err(err);
        }

        let raw = self.core.pending.wait(call).map_err(|err| {
            logging::error!(self.core.log, "call failed";
                            "context" => "send_and_wait",
                            "req_id" => req_id.as_str(),
                            "error" => %err);
            err
        })?;

        Envelope::from_slice(&raw)
    }

    /// Performs the `subscribeEvent` call and records the callback for the
    /// event. There is no unsubscribe; the table lives until termination.
    pub fn subscribe_event<F>(
        &self,
        event_name: &str,
        notification_type: &str,
        callback: F,
    ) -> HalResult<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut request = self.request_header(action::SUBSCRIBE_EVENT);
        let params = request
            .params
            .as_mut()
            .expect("subscribe request always carries a params array");
        let mut param = message::Param::named(event_name);
        param.notification_type = Some(notification_type.to_owned());
        params.push(param);

        self.send_and_wait(&request)?;

        let mode = NotificationMode::parse(notification_type).unwrap_or_else(|| {
            logging::warn!(self.core.log, "unknown notification type, using onChange";
                           "context" => "subscribe_event",
                           "notification_type" => notification_type);
            NotificationMode::OnChange
        });

        self.core.subscriptions.lock().unwrap().push(EventSubscription {
            name: event_name.to_owned(),
            mode,
            callback: Arc::new(callback),
        });

        logging::info!(self.core.log, "event subscribed";
                       "event" => event_name,
                       "notification_type" => notification_type);
        Ok(())
    }

    /// Stops the I/O thread and drains the in-flight and subscription
    /// tables. Waits up to a few seconds for a graceful thread exit.
    pub fn terminate(&self) -> HalResult<()> {
        self.core.running.store(false, Ordering::SeqCst);

        let mut rounds = TERMINATE_WAIT_ROUNDS;
        while rounds > 0 && self.core.thread_running.load(Ordering::SeqCst) {
            thread::sleep(self.core.config.request_timeout);
            rounds -= 1;
        }
        if self.core.thread_running.load(Ordering::SeqCst) {
            logging::warn!(self.core.log, "transport thread did not stop in time"; "context" => "terminate");
        } else {
            logging::info!(self.core.log, "transport thread terminated gracefully"; "context" => "terminate");
        }

        self.core.pending.clear();
        self.core.subscriptions.lock().unwrap().clear();
        Ok(())
    }

    /// The configuration this endpoint was initialised with.
    pub fn config(&self) -> &HalConfig {
        &self.core.config
    }
}
