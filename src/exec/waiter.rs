//! Process-wide waiter table for `memory.atomic.wait`/`notify`, keyed by
//! `(memory, address)`. The load-compare and the wait registration happen
//! under the table mutex, so a concurrent `notify` can never slip between
//! them and be lost.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::StopToken;
use crate::error::Trap;
use crate::runtime::{MemAddr, MemoryInstance};

/// `memory.atomic.wait` result values.
pub const WAIT_OK: u32 = 0;
pub const WAIT_NOT_EQUAL: u32 = 1;
pub const WAIT_TIMED_OUT: u32 = 2;

#[derive(Debug, Default)]
struct Waiter {
    woken: Mutex<bool>,
    cv: Condvar,
}

#[derive(Debug, Default)]
pub struct WaiterTable {
    map: Mutex<HashMap<(MemAddr, u64), VecDeque<Arc<Waiter>>>>,
}

enum Outcome {
    Woken,
    Stopped,
    TimedOut,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until notified, timed out, or stopped. `timeout_ns < 0` means no
    /// timeout. Returns 0 (woken), 1 (value mismatch), or 2 (timed out);
    /// stop surfaces as an `Interrupted` trap.
    pub fn wait(
        &self,
        mem_addr: MemAddr,
        mem: &MemoryInstance,
        addr: u64,
        expected: u64,
        size: usize,
        timeout_ns: i64,
        stop: &StopToken,
        entry_epoch: u64,
    ) -> Result<u32, Trap> {
        let key = (mem_addr, addr);
        let waiter = {
            let mut map = self.map.lock().expect("waiter map lock");
            // Re-read the cell under the map lock: indivisible with respect
            // to any notify, which also takes the map lock.
            let current = mem.atomic_load(addr, size)?;
            if current != expected {
                return Ok(WAIT_NOT_EQUAL);
            }
            if stop.stopped_since(entry_epoch) {
                return Err(Trap::Interrupted);
            }
            let waiter = Arc::new(Waiter::default());
            map.entry(key).or_default().push_back(waiter.clone());
            waiter
        };

        let deadline = if timeout_ns >= 0 {
            Some(Instant::now() + Duration::from_nanos(timeout_ns as u64))
        } else {
            None
        };

        let outcome = {
            let mut woken = waiter.woken.lock().expect("waiter lock");
            loop {
                if *woken {
                    break Outcome::Woken;
                }
                if stop.stopped_since(entry_epoch) {
                    break Outcome::Stopped;
                }
                match deadline {
                    None => {
                        woken = waiter.cv.wait(woken).expect("waiter lock");
                    }
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            break Outcome::TimedOut;
                        }
                        let (guard, _) = waiter
                            .cv
                            .wait_timeout(woken, d - now)
                            .expect("waiter lock");
                        woken = guard;
                    }
                }
            }
        };

        match outcome {
            Outcome::Woken => Ok(WAIT_OK),
            Outcome::Stopped => {
                if self.remove(key, &waiter) {
                    Err(Trap::Interrupted)
                } else {
                    // A notify claimed this waiter concurrently; it counts as
                    // woken, and the stop lands at the next back-edge.
                    Ok(WAIT_OK)
                }
            }
            Outcome::TimedOut => {
                if self.remove(key, &waiter) {
                    Ok(WAIT_TIMED_OUT)
                } else {
                    Ok(WAIT_OK)
                }
            }
        }
    }

    /// Remove `waiter` from its bucket. Returns false when a notify already
    /// claimed it.
    fn remove(&self, key: (MemAddr, u64), waiter: &Arc<Waiter>) -> bool {
        let mut map = self.map.lock().expect("waiter map lock");
        let Some(bucket) = map.get_mut(&key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|w| !Arc::ptr_eq(w, waiter));
        let removed = bucket.len() < before;
        if bucket.is_empty() {
            map.remove(&key);
        }
        removed
    }

    /// Wake up to `count` waiters parked on `(mem_addr, addr)`. Returns the
    /// number actually woken.
    pub fn notify(&self, mem_addr: MemAddr, addr: u64, count: u32) -> u32 {
        let mut map = self.map.lock().expect("waiter map lock");
        let Some(bucket) = map.get_mut(&(mem_addr, addr)) else {
            return 0;
        };
        let n = (count as usize).min(bucket.len());
        for _ in 0..n {
            if let Some(w) = bucket.pop_front() {
                *w.woken.lock().expect("waiter lock") = true;
                w.cv.notify_one();
            }
        }
        if bucket.is_empty() {
            map.remove(&(mem_addr, addr));
        }
        n as u32
    }

    /// Kick every parked waiter so it re-checks the stop token. Does not mark
    /// anyone as woken.
    pub fn wake_all(&self) {
        let map = self.map.lock().expect("waiter map lock");
        for bucket in map.values() {
            for w in bucket.iter() {
                let _guard = w.woken.lock().expect("waiter lock");
                w.cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::MemoryType;

    #[test]
    fn mismatch_returns_immediately() {
        let table = WaiterTable::new();
        let mem = MemoryInstance::new(MemoryType::shared(1, 1));
        mem.atomic_store(0, 4, 7).unwrap();
        let stop = StopToken::default();
        let r = table
            .wait(MemAddr(0), &mem, 0, 0, 4, -1, &stop, stop.epoch())
            .unwrap();
        assert_eq!(r, WAIT_NOT_EQUAL);
    }

    #[test]
    fn timeout_elapses() {
        let table = WaiterTable::new();
        let mem = MemoryInstance::new(MemoryType::shared(1, 1));
        let stop = StopToken::default();
        let r = table
            .wait(MemAddr(0), &mem, 0, 0, 4, 1_000_000, &stop, stop.epoch())
            .unwrap();
        assert_eq!(r, WAIT_TIMED_OUT);
    }

    #[test]
    fn notify_wakes_waiter() {
        let table = Arc::new(WaiterTable::new());
        let mem = Arc::new(MemoryInstance::new(MemoryType::shared(1, 1)));
        let stop = Arc::new(StopToken::default());
        let t = {
            let (table, mem, stop) = (table.clone(), mem.clone(), stop.clone());
            std::thread::spawn(move || {
                table.wait(MemAddr(0), &mem, 8, 0, 4, -1, &stop, stop.epoch())
            })
        };
        // Spin until the waiter is registered, then notify.
        loop {
            if table.notify(MemAddr(0), 8, 1) == 1 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(t.join().unwrap().unwrap(), WAIT_OK);
    }

    #[test]
    fn stop_interrupts_wait() {
        let table = Arc::new(WaiterTable::new());
        let mem = Arc::new(MemoryInstance::new(MemoryType::shared(1, 1)));
        let stop = Arc::new(StopToken::default());
        let epoch = stop.epoch();
        let t = {
            let (table, mem, stop) = (table.clone(), mem.clone(), stop.clone());
            std::thread::spawn(move || table.wait(MemAddr(0), &mem, 0, 0, 4, -1, &stop, epoch))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        stop.trip();
        table.wake_all();
        assert!(matches!(t.join().unwrap(), Err(Trap::Interrupted)));
    }
}
