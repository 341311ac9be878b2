/// Single-slot synchronous call rendezvous.
///
/// Any thread may submit a function with two parameters and block until the
/// owner thread has executed it via [`CallSlot::pump`]. The slot holds at most
/// one outstanding request: a dedicated submission lock serializes callers, so
/// this is a rendezvous, not a queue.
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A function executed on the owner thread on behalf of another thread.
pub type SyncFn = Box<dyn FnOnce(i64, i64) -> i64 + Send>;

/// The single in-flight request.
#[derive(Default)]
struct CallRequest {
    function: Option<SyncFn>,
    param1: i64,
    param2: i64,
    result: i64,
    pending: bool,
}

#[derive(Default)]
pub struct CallSlot {
    /// Held by a caller for the whole submit-wait-read cycle.
    submit: Mutex<()>,
    state: Mutex<CallRequest>,
    done: Condvar,
}

impl std::fmt::Debug for CallSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSlot")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl CallSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit `function(param1, param2)` and block until the owner thread has
    /// run it, returning its result.
    ///
    /// Blocks forever if nothing ever calls [`CallSlot::pump`]. Must not be
    /// called from the thread that pumps.
    ///
    /// `function` runs with the slot locked, so it must not call back into
    /// this slot: not [`CallSlot::pump`], not [`CallSlot::is_pending`], and
    /// nothing that reaches them, such as `Daemon::tick` or `{:?}` on the
    /// `Daemon`. If `function` panics, the call never returns.
    pub fn invoke<F>(&self, function: F, param1: i64, param2: i64) -> i64
    where
        F: FnOnce(i64, i64) -> i64 + Send + 'static,
    {
        let _submit = self.submit.lock().unwrap_or_else(PoisonError::into_inner);

        let state = self.submit_request(Box::new(function), param1, param2);
        self.wait_done(state)
    }

    /// Like [`CallSlot::invoke`], but gives up after `timeout`.
    ///
    /// Returns `None` if the request was not executed in time. A request that
    /// timed out is withdrawn from the slot, so it will never run later. A
    /// timeout too large to represent as a deadline waits without bound.
    pub fn invoke_timeout<F>(
        &self,
        function: F,
        param1: i64,
        param2: i64,
        timeout: Duration,
    ) -> Option<i64>
    where
        F: FnOnce(i64, i64) -> i64 + Send + 'static,
    {
        let _submit = self.submit.lock().unwrap_or_else(PoisonError::into_inner);

        let mut state = self.submit_request(Box::new(function), param1, param2);
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait_done(state));
        };
        while state.pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Execution happens under the state lock, so a request still
                // pending here has not started.
                state.function = None;
                state.pending = false;
                tracing::debug!(?timeout, "sync call timed out, request withdrawn");
                return None;
            }
            state = self
                .done
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(state.result)
    }

    /// Execute the pending request, if any. Returns `true` if one ran.
    ///
    /// Runs at most one request per call, on the calling thread, while holding
    /// the state lock: no waiter can observe a half-executed request.
    ///
    /// A request whose function panicked stays pending with no function; it
    /// is never completed, so its caller cannot read a stale result.
    pub fn pump(&self) -> bool {
        let mut state = self.lock_state();
        if !state.pending {
            return false;
        }
        let Some(function) = state.function.take() else {
            return false;
        };
        state.result = function(state.param1, state.param2);
        tracing::debug!(
            param1 = state.param1,
            param2 = state.param2,
            result = state.result,
            "sync call executed"
        );
        state.pending = false;
        drop(state);
        self.done.notify_all();
        true
    }

    /// Whether a request is waiting to be pumped.
    pub fn is_pending(&self) -> bool {
        self.lock_state().pending
    }

    fn submit_request(
        &self,
        function: SyncFn,
        param1: i64,
        param2: i64,
    ) -> MutexGuard<'_, CallRequest> {
        let mut state = self.lock_state();
        state.function = Some(function);
        state.param1 = param1;
        state.param2 = param2;
        state.pending = true;
        state
    }

    fn wait_done(&self, mut state: MutexGuard<'_, CallRequest>) -> i64 {
        while state.pending {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.result
    }

    fn lock_state(&self) -> MutexGuard<'_, CallRequest> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Pump `slot` every `interval` until `stop` is set; returns how many
    /// requests were executed.
    fn spawn_pump(
        slot: Arc<CallSlot>,
        stop: Arc<AtomicBool>,
        interval: Duration,
    ) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let mut executed = 0;
            while !stop.load(Ordering::SeqCst) {
                if slot.pump() {
                    executed += 1;
                }
                std::thread::sleep(interval);
            }
            executed
        })
    }

    #[test]
    fn test_pump_without_request_is_noop() {
        let slot = CallSlot::new();
        assert!(!slot.pump());
        assert!(!slot.is_pending());
    }

    #[test]
    fn test_invoke_add_returns_sum() {
        let slot = Arc::new(CallSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(
            Arc::clone(&slot),
            Arc::clone(&stop),
            Duration::from_millis(100),
        );

        let start = Instant::now();
        let result = slot.invoke(|a, b| a + b, 2, 3);
        assert_eq!(result, 5);
        assert!(start.elapsed() < Duration::from_secs(1));

        stop.store(true, Ordering::SeqCst);
        assert_eq!(pump.join().unwrap(), 1);
    }

    #[test]
    fn test_function_runs_on_pumping_thread() {
        let slot = Arc::new(CallSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(
            Arc::clone(&slot),
            Arc::clone(&stop),
            Duration::from_millis(5),
        );
        let pump_thread = pump.thread().id();

        let ran_on = Arc::new(Mutex::new(None));
        let record = Arc::clone(&ran_on);
        slot.invoke(
            move |_, _| {
                *record.lock().unwrap() = Some(std::thread::current().id());
                0
            },
            0,
            0,
        );

        stop.store(true, Ordering::SeqCst);
        pump.join().unwrap();
        assert_eq!(*ran_on.lock().unwrap(), Some(pump_thread));
    }

    #[test]
    fn test_concurrent_invokes_get_their_own_results() {
        let slot = Arc::new(CallSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(
            Arc::clone(&slot),
            Arc::clone(&stop),
            Duration::from_millis(2),
        );

        let callers: Vec<_> = (0..16i64)
            .map(|i| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || {
                    let got = slot.invoke(|a, b| a * 1000 + b, i, i + 1);
                    (i, got)
                })
            })
            .collect();

        for caller in callers {
            let (i, got) = caller.join().unwrap();
            assert_eq!(got, i * 1000 + i + 1, "caller {i} saw another caller's result");
        }

        stop.store(true, Ordering::SeqCst);
        // One request per tick, none lost, none run twice.
        assert_eq!(pump.join().unwrap(), 16);
    }

    #[test]
    fn test_at_most_one_request_executes_at_a_time() {
        let slot = Arc::new(CallSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(
            Arc::clone(&slot),
            Arc::clone(&stop),
            Duration::from_millis(1),
        );
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    slot.invoke(
                        move |_, _| {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(2));
                            running.fetch_sub(1, Ordering::SeqCst);
                            0
                        },
                        0,
                        0,
                    )
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        stop.store(true, Ordering::SeqCst);
        pump.join().unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!slot.is_pending());
    }

    #[test]
    fn test_invoke_timeout_without_pump_withdraws_request() {
        let slot = CallSlot::new();
        let result = slot.invoke_timeout(|a, b| a + b, 2, 3, Duration::from_millis(200));
        assert_eq!(result, None);
        assert!(!slot.is_pending());
        // The withdrawn request must not run on a later pump.
        assert!(!slot.pump());
    }

    #[test]
    fn test_invoke_timeout_with_pump_returns_result() {
        let slot = Arc::new(CallSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(
            Arc::clone(&slot),
            Arc::clone(&stop),
            Duration::from_millis(100),
        );

        let result = slot.invoke_timeout(|a, b| a + b, 2, 3, Duration::from_secs(5));
        assert_eq!(result, Some(5));

        stop.store(true, Ordering::SeqCst);
        pump.join().unwrap();
    }

    #[test]
    fn test_invoke_timeout_unbounded_duration_waits_for_pump() {
        let slot = Arc::new(CallSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(
            Arc::clone(&slot),
            Arc::clone(&stop),
            Duration::from_millis(5),
        );

        let caller = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.invoke_timeout(|a, b| a + b, 2, 3, Duration::MAX))
        };
        assert_eq!(caller.join().unwrap(), Some(5));

        stop.store(true, Ordering::SeqCst);
        assert_eq!(pump.join().unwrap(), 1);
    }

    #[test]
    fn test_panicked_request_is_never_completed() {
        let slot = Arc::new(CallSlot::new());

        let caller = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                slot.invoke_timeout(|_, _| panic!("boom"), 0, 0, Duration::from_millis(500))
            })
        };
        while !slot.is_pending() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let pumper = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.pump())
        };
        assert!(pumper.join().is_err());

        // The slot is still marked pending but has nothing left to run.
        assert!(slot.is_pending());
        assert!(!slot.pump());

        // The caller times out instead of reading a result nobody produced.
        assert_eq!(caller.join().unwrap(), None);
        assert!(!slot.is_pending());
    }

    #[test]
    fn test_invoke_blocks_while_not_pumped() {
        let slot = Arc::new(CallSlot::new());
        let finished = Arc::new(AtomicBool::new(false));

        let caller = {
            let slot = Arc::clone(&slot);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                let result = slot.invoke(|a, b| a + b, 2, 3);
                finished.store(true, Ordering::SeqCst);
                result
            })
        };

        std::thread::sleep(Duration::from_millis(300));
        assert!(!finished.load(Ordering::SeqCst));
        assert!(slot.is_pending());

        // Release the caller so the test thread can exit.
        assert!(slot.pump());
        assert_eq!(caller.join().unwrap(), 5);
    }
}
