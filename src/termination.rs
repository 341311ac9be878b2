use std::sync::{Mutex, PoisonError};

/// Process-wide termination gate.
///
/// A cooperative cancellation signal: the listener loop polls it between
/// iterations. Setting it does not interrupt blocked I/O.
#[derive(Debug, Default)]
pub struct TerminationFlag {
    flag: Mutex<bool>,
}

impl TerminationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new value. Once `true`, the flag stays `true`: later writes,
    /// including `set(false)`, are no-ops.
    pub fn set(&self, value: bool) {
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        if *flag {
            if !value {
                tracing::debug!("termination flag already set, ignoring reset");
            }
            return;
        }
        if value {
            tracing::debug!("termination flag set");
            *flag = true;
        }
    }

    pub fn get(&self) -> bool {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
