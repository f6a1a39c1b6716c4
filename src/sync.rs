//! Lock helpers that recover from poisoning instead of propagating a panic.
//!
//! The cache and the listener registry both treat a poisoned lock as
//! recoverable: the guarded maps hold no invariant that a panicking user
//! callback could have broken halfway.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, target: &'static str, op: &'static str) -> MutexGuard<'a, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => {
      warn!(
        op,
        target_module = target,
        result = "poisoned_recovered",
        "Recovered from poisoned lock"
      );
      poisoned.into_inner()
    }
  }
}
