//! In-flight request tracking: the correlation engine behind synchronous
//! calls. A slot exists exactly while its caller is waiting; the matcher or
//! the reaper fills in the outcome and signals the slot's condition.

use std::sync::{Arc, Condvar, Mutex};

use hashbrown::HashMap;

use crate::logging;
use crate::shared::{HalError, HalResult};

/// Idle ticks (~250 ms each) an in-flight call survives before the reaper
/// expires it; 40 ticks give the nominal 10 s call timeout.
pub const DEFAULT_TICKER: i32 = 40;

struct SlotState {
    ticker: i32,
    outcome: Option<HalResult<Vec<u8>>>,
}

struct Slot {
    state: Mutex<SlotState>,
    completed: Condvar,
}

impl Slot {
    fn finish(&self, outcome: HalResult<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.outcome = Some(outcome);
        self.completed.notify_one();
    }
}

/// Handle for one registered call, returned to the issuing thread.
pub struct PendingCall {
    req_id: String,
    slot: Arc<Slot>,
}

pub struct PendingTable {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    log: logging::Logger,
}

impl PendingTable {
    pub fn new(log: logging::Logger) -> PendingTable {
        PendingTable {
            slots: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Registers a slot for `req_id`. At most one slot per id exists; a
    /// duplicate registration replaces the stale entry.
    pub fn register(&self, req_id: &str, ticker: i32) -> PendingCall {
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState {
                ticker,
                outcome: None,
            }),
            completed: Condvar::new(),
        });

        self.slots
            .lock()
            .unwrap()
            .insert(req_id.to_owned(), Arc::clone(&slot));

        PendingCall {
            req_id: req_id.to_owned(),
            slot,
        }
    }

    /// Drops a registered slot without waiting (send-failure path).
    pub fn discard(&self, call: &PendingCall) {
        self.slots.lock().unwrap().remove(&call.req_id);
    }

    /// Blocks until the matcher or the reaper signals the slot, then
    /// returns the outcome. The slot is gone afterwards on every path.
    pub fn wait(&self, call: PendingCall) -> HalResult<Vec<u8>> {
        let outcome = {
            let mut state = call.slot.state.lock().unwrap();
            while state.outcome.is_none() {
                state = call.slot.completed.wait(state).unwrap();
            }
            state.outcome.take().unwrap()
        };

        self.slots.lock().unwrap().remove(&call.req_id);
        outcome
    }

    /// Delivers a reply to the slot registered under `req_id`. Returns false
    /// when no caller is waiting for that id.
    pub fn complete(&self, req_id: &str, raw: &[u8]) -> bool {
        let slot = self.slots.lock().unwrap().remove(req_id);
        match slot {
            Some(slot) => {
                slot.finish(Ok(raw.to_vec()));
                true
            }
            None => false,
        }
    }

    /// One idle tick: decrements every slot and expires the ones that hit
    /// zero.
    pub fn tick(&self) {
        let mut expired = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap();
            slots.retain(|req_id, slot| {
                let mut state = slot.state.lock().unwrap();
                state.ticker -= 1;
                if state.ticker <= 0 {
                    state.outcome = Some(Err(HalError::Timeout));
                    slot.completed.notify_one();
                    expired.push(req_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        for req_id in expired {
            logging::error!(self.log, "request expired"; "context" => "tick", "req_id" => req_id);
        }
    }

    /// Expires everything still in flight (termination path).
    pub fn clear(&self) {
        let drained: Vec<Arc<Slot>> = self.slots.lock().unwrap().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.finish(Err(HalError::Timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn table() -> Arc<PendingTable> {
        Arc::new(PendingTable::new(logging::Logger::root(
            logging::Discard,
            logging::o!(),
        )))
    }

    #[test]
    fn test_complete_wakes_the_waiter() {
        let table = table();
        let call = table.register("000003E9", DEFAULT_TICKER);

        let matcher = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.complete("000003E9", b"{\"reqId\": \"000003E9\"}")
            })
        };

        let raw = table.wait(call).unwrap();

        assert_eq!(raw, b"{\"reqId\": \"000003E9\"}".to_vec());
        assert!(matcher.join().unwrap());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_tick_expires_slot() {
        let table = table();
        let call = table.register("000003EA", 2);

        table.tick();
        assert_eq!(table.len(), 1);
        table.tick();
        assert_eq!(table.len(), 0);

        assert_eq!(table.wait(call), Err(HalError::Timeout));
    }

    #[test]
    fn test_unmatched_reply_is_reported() {
        let table = table();

        assert!(!table.complete("deadbeef", b"{}"));
    }

    #[test]
    fn test_discard_removes_the_slot() {
        let table = table();
        let call = table.register("000003EB", DEFAULT_TICKER);

        table.discard(&call);

        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_late_reply_after_expiry_matches_nothing() {
        let table = table();
        let call = table.register("000003EC", 1);

        table.tick();
        assert_eq!(table.wait(call), Err(HalError::Timeout));

        assert!(!table.complete("000003EC", b"{}"));
    }

    #[test]
    fn test_concurrent_calls_each_get_their_reply() {
        let table = table();
        let first = table.register("00000100", DEFAULT_TICKER);
        let second = table.register("00000101", DEFAULT_TICKER);

        let matcher = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                // Replies for different ids may interleave arbitrarily.
                table.complete("00000101", b"B");
                table.complete("00000100", b"A");
            })
        };

        assert_eq!(table.wait(first).unwrap(), b"A".to_vec());
        assert_eq!(table.wait(second).unwrap(), b"B".to_vec());
        matcher.join().unwrap();
    }
}
