//! Shared live subscriptions.
//!
//! Many independent callers may want live updates for the same remote
//! resource. The registry keeps at most one underlying subscription per key
//! and fans every update out to all attached callers.

mod registry;

pub use registry::{Emitter, ListenerRegistry, Subscription, Teardown, DEFAULT_IDLE_GRACE};
