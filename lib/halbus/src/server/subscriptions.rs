//! Subscription registry and the synchronous publish protocol.
//!
//! Each record tracks one (connection, event) pair and the state of the last
//! message published to it: `Idle → Waiting → {Success | Error} → Waiting …`.
//! Only the publisher and the acknowledgement path mutate that state. The
//! publisher marks its synchronous targets `Waiting` under the registry lock
//! *before* anything is sent, then sends with the lock released and parks on
//! the registry condition until the ack path has flipped every target.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::logging;
use crate::message::{self, Envelope, NotificationMode, Status};
use crate::shared::{self, HalError, HalResult};

use super::{ConnId, ServerCore};

/// Ceiling for a synchronous publish in the timeout mode.
pub(crate) const ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PublishState {
    Idle,
    Waiting(String),
    Success,
    Error,
}

pub(crate) struct Subscription {
    pub(crate) conn: ConnId,
    pub(crate) event: String,
    pub(crate) mode: NotificationMode,
    pub(crate) last: PublishState,
}

pub(crate) struct SubscriptionRegistry {
    pub(crate) entries: Mutex<Vec<Subscription>>,
    acked: Condvar,
    log: logging::Logger,
}

impl SubscriptionRegistry {
    pub(crate) fn new(log: logging::Logger) -> SubscriptionRegistry {
        SubscriptionRegistry {
            entries: Mutex::new(Vec::new()),
            acked: Condvar::new(),
            log,
        }
    }

    pub(crate) fn add(&self, conn: ConnId, event: &str, mode: NotificationMode) {
        self.entries.lock().unwrap().push(Subscription {
            conn,
            event: event.to_owned(),
            mode,
            last: PublishState::Idle,
        });
        logging::info!(self.log, "subscription added";
                       "conn" => conn,
                       "event" => event,
                       "notification_type" => mode.as_str());
    }

    /// Drops every record bound to a departed connection and wakes any
    /// publisher that might have been waiting on it.
    pub(crate) fn remove_connection(&self, conn: ConnId) {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|subscription| subscription.conn != conn);
            before - entries.len()
        };
        if removed > 0 {
            self.acked.notify_all();
            logging::debug!(self.log, "subscriptions swept";
                            "conn" => conn,
                            "removed" => removed);
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().unwrap().clear();
        self.acked.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn count_for(&self, event: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|subscription| subscription.event == event)
            .count()
    }

    /// Routes an inbound `result` envelope. A record waiting on the exact
    /// (connection, event, reqId) triple flips to Success or Error per the
    /// envelope's status; anything else is ignored.
    pub(crate) fn handle_ack(&self, conn: ConnId, envelope: &Envelope) {
        let status = match envelope
            .result
            .as_ref()
            .and_then(|result| result.status.as_ref())
        {
            Some(status) => status.clone(),
            None => {
                logging::error!(self.log, "result envelope without status"; "conn" => conn);
                return;
            }
        };
        let event_name = match envelope.first_param() {
            Some(param) => param.name.clone(),
            None => {
                logging::error!(self.log, "result envelope without event name"; "conn" => conn);
                return;
            }
        };
        let req_id = match envelope.req_id() {
            Some(req_id) => req_id.canonical(),
            None => {
                logging::error!(self.log, "result envelope without reqId"; "conn" => conn);
                return;
            }
        };

        let outcome = if status == Status::Success.as_str() {
            PublishState::Success
        } else {
            PublishState::Error
        };

        let mut matched = false;
        {
            let mut entries = self.entries.lock().unwrap();
            for subscription in entries
                .iter_mut()
                .filter(|subscription| subscription.conn == conn && subscription.event == event_name)
            {
                if let PublishState::Waiting(ref waiting) = subscription.last {
                    if *waiting == req_id {
                        subscription.last = outcome.clone();
                        matched = true;
                    }
                }
            }
        }

        if matched {
            self.acked.notify_all();
        } else {
            logging::debug!(self.log, "ignoring unmatched ack";
                            "conn" => conn,
                            "event" => event_name,
                            "req_id" => req_id);
        }
    }

    /// Parks until no staged connection still has a `Waiting` record for the
    /// event. The deadline only binds records in the timeout mode; a plain
    /// sync subscriber extends the wait indefinitely.
    fn wait_acks(&self, event_name: &str, staged: &[ConnId], deadline: Duration) -> HalResult<()> {
        let started = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        loop {
            let mut waiting = false;
            let mut unbounded = false;
            let mut failed = false;

            for subscription in entries.iter().filter(|subscription| {
                subscription.event == event_name && staged.contains(&subscription.conn)
            }) {
                match subscription.last {
                    PublishState::Waiting(_) => {
                        waiting = true;
                        if subscription.mode == NotificationMode::OnChangeSync {
                            unbounded = true;
                        }
                    }
                    PublishState::Error => failed = true,
                    _ => (),
                }
            }

            if !waiting {
                return if failed {
                    Err(HalError::EventAckFailed)
                } else {
                    Ok(())
                };
            }

            if unbounded {
                entries = self.acked.wait(entries).unwrap();
            } else {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Err(HalError::Timeout);
                }
                let (guard, _) = self
                    .acked
                    .wait_timeout(entries, deadline - elapsed)
                    .unwrap();
                entries = guard;
            }
        }
    }
}

struct Target {
    conn: ConnId,
    synchronous: bool,
    req_id: String,
    bytes: Vec<u8>,
}

/// Publishes one event to every subscriber of `event_name`. Each subscriber
/// gets its own envelope with a fresh decimal id.
pub(crate) fn publish(core: &ServerCore, event_name: &str, event_value: &str) -> HalResult<()> {
    // Stage under the registry lock: every synchronous target is Waiting
    // before its envelope can possibly be acknowledged.
    let targets: Vec<Target> = {
        let mut entries = core.subscriptions.entries.lock().unwrap();
        entries
            .iter_mut()
            .filter(|subscription| subscription.event == event_name)
            .map(|subscription| {
                let sequence = shared::next_seq(&core.sequence);
                let envelope = message::event_envelope(
                    &core.config.module_name,
                    &core.config.module_version,
                    sequence,
                    event_name,
                    event_value,
                );
                let req_id = sequence.to_string();
                if subscription.mode.is_synchronous() {
                    subscription.last = PublishState::Waiting(req_id.clone());
                }
                Target {
                    conn: subscription.conn,
                    synchronous: subscription.mode.is_synchronous(),
                    req_id,
                    bytes: envelope.to_wire(),
                }
            })
            .collect()
    };

    if targets.is_empty() {
        logging::debug!(core.log, "no subscriber for event"; "event" => event_name);
        return Ok(());
    }

    let mut any_sync_sent = false;
    let mut staged: Vec<ConnId> = Vec::new();
    let mut first_send_error: Option<HalError> = None;

    for target in &targets {
        match core.send_to(target.conn, &target.bytes) {
            Ok(()) => {
                if target.synchronous {
                    any_sync_sent = true;
                    staged.push(target.conn);
                }
            }
            Err(err) => {
                logging::error!(core.log, "failed to publish event";
                                "event" => event_name,
                                "conn" => target.conn,
                                "error" => %err);
                if target.synchronous {
                    // Don't wait on a message that never went out.
                    let mut entries = core.subscriptions.entries.lock().unwrap();
                    for subscription in entries.iter_mut().filter(|subscription| {
                        subscription.conn == target.conn && subscription.event == event_name
                    }) {
                        if subscription.last == PublishState::Waiting(target.req_id.clone()) {
                            subscription.last = PublishState::Error;
                        }
                    }
                }
                if first_send_error.is_none() {
                    first_send_error = Some(err);
                }
            }
        }
    }

    let wait_result = if any_sync_sent {
        core.subscriptions.wait_acks(event_name, &staged, ACK_TIMEOUT)
    } else {
        Ok(())
    };

    match first_send_error {
        Some(err) => Err(err),
        None => wait_result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn registry() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(logging::Logger::root(
            logging::Discard,
            logging::o!(),
        )))
    }

    fn ack_envelope(event: &str, req_id: &str, status: Status) -> Envelope {
        message::event_ack("m", "1", &message::ReqId::Text(req_id.to_owned()), event, status)
    }

    #[test]
    fn test_remove_connection_sweeps_records() {
        let registry = registry();
        registry.add(3, "Device.A", NotificationMode::OnChange);
        registry.add(3, "Device.B", NotificationMode::OnChangeSync);
        registry.add(4, "Device.A", NotificationMode::OnChange);

        registry.remove_connection(3);

        assert_eq!(registry.count_for("Device.A"), 1);
        assert_eq!(registry.count_for("Device.B"), 0);
    }

    #[test]
    fn test_ack_flips_waiting_record() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSyncTimeout);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        registry.handle_ack(7, &ack_envelope("Device.A", "105", Status::Success));

        assert_eq!(registry.entries.lock().unwrap()[0].last, PublishState::Success);
    }

    #[test]
    fn test_ack_with_wrong_id_is_ignored() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSyncTimeout);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        registry.handle_ack(7, &ack_envelope("Device.A", "999", Status::Success));

        assert_eq!(
            registry.entries.lock().unwrap()[0].last,
            PublishState::Waiting("105".to_owned())
        );
    }

    #[test]
    fn test_ack_from_other_connection_is_ignored() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSync);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        registry.handle_ack(8, &ack_envelope("Device.A", "105", Status::Success));

        assert_eq!(
            registry.entries.lock().unwrap()[0].last,
            PublishState::Waiting("105".to_owned())
        );
    }

    #[test]
    fn test_failed_ack_marks_error() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSync);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        registry.handle_ack(7, &ack_envelope("Device.A", "105", Status::Failed));

        assert_eq!(registry.entries.lock().unwrap()[0].last, PublishState::Error);
    }

    #[test]
    fn test_wait_acks_returns_once_acked() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSyncTimeout);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        let acker = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                registry.handle_ack(7, &ack_envelope("Device.A", "105", Status::Success));
            })
        };

        let result = registry.wait_acks("Device.A", &[7], Duration::from_secs(2));

        assert_eq!(result, Ok(()));
        acker.join().unwrap();
    }

    #[test]
    fn test_wait_acks_times_out() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSyncTimeout);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        let started = Instant::now();
        let result = registry.wait_acks("Device.A", &[7], Duration::from_millis(80));

        assert_eq!(result, Err(HalError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_wait_acks_error_on_rejected_event() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSyncTimeout);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        let acker = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                registry.handle_ack(7, &ack_envelope("Device.A", "105", Status::Failed));
            })
        };

        let result = registry.wait_acks("Device.A", &[7], Duration::from_secs(2));

        assert_eq!(result, Err(HalError::EventAckFailed));
        acker.join().unwrap();
    }

    #[test]
    fn test_wait_acks_released_by_disconnect_sweep() {
        let registry = registry();
        registry.add(7, "Device.A", NotificationMode::OnChangeSync);
        registry.entries.lock().unwrap()[0].last = PublishState::Waiting("105".to_owned());

        let sweeper = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                registry.remove_connection(7);
            })
        };

        // The record is gone, so nothing is waiting any more.
        let result = registry.wait_acks("Device.A", &[7], Duration::from_secs(2));

        assert_eq!(result, Ok(()));
        sweeper.join().unwrap();
    }
}
