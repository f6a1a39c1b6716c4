//! Subscription multiplexer: one remote subscription per key, shared by every caller.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::sync::lock;

/// How long a subscription with no attached callers is kept alive.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(5 * 60);

const SOURCE: &str = "listener::registry";

/// Cancels an underlying remote subscription.
pub type Teardown = Box<dyn FnOnce() + Send>;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

thread_local! {
  /// Slots whose callbacks are running on this thread, innermost last.
  static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn is_delivering(slot_id: u64) -> bool {
  DELIVERING.with(|delivering| delivering.borrow().contains(&slot_id))
}

/// Deduplicates live subscriptions across independent callers.
///
/// The first [`attach`](Self::attach) for a key runs its setup function;
/// later attaches for the same key join the running subscription. When the
/// last caller detaches, the subscription is kept for an idle grace period
/// and only torn down if nobody attaches again in the meantime.
pub struct ListenerRegistry<T> {
  inner: Arc<RegistryInner<T>>,
}

struct RegistryInner<T> {
  entries: Mutex<HashMap<String, ListenerEntry<T>>>,
  idle_grace: Duration,
  next_id: AtomicU64,
  /// Runtime the idle timers run on, captured at creation or first attach
  runtime: Mutex<Option<Handle>>,
}

struct ListenerEntry<T> {
  /// Identifies one active period of the key
  generation: u64,
  /// Attached callers in attachment order
  slots: Vec<Arc<Slot<T>>>,
  /// None until setup returns, and after it has been taken
  teardown: Option<Teardown>,
  idle_timer: Option<IdleTimer>,
}

struct IdleTimer {
  token: u64,
  handle: JoinHandle<()>,
}

/// One attached caller.
struct Slot<T> {
  id: u64,
  callback: Callback<T>,
  active: AtomicBool,
  /// Held while the callback runs so detach can wait out a delivery
  gate: Mutex<()>,
}

impl<T> Slot<T> {
  fn deliver(&self, key: &str, value: &T) -> bool {
    // An emit from inside this slot's own callback would wait on its own gate
    if is_delivering(self.id) {
      debug!(key, "Skipping nested delivery to a callback that is still running");
      return false;
    }

    let _gate = lock(&self.gate, SOURCE, "deliver");
    if !self.active.load(Ordering::Acquire) {
      return false;
    }

    DELIVERING.with(|delivering| delivering.borrow_mut().push(self.id));
    let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(value)));
    DELIVERING.with(|delivering| delivering.borrow_mut().pop());

    if let Err(panic) = outcome {
      error!(key, panic = panic_message(&*panic), "Listener callback panicked");
    }
    true
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
  panic
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("non-string panic payload")
}

fn run_teardown(key: &str, teardown: Teardown) {
  debug!(key, "Tearing down subscription");
  if let Err(panic) = catch_unwind(AssertUnwindSafe(teardown)) {
    error!(key, panic = panic_message(&*panic), "Subscription teardown panicked");
  }
}

impl<T: 'static> ListenerRegistry<T> {
  /// Create a registry. Idle timers run on the tokio runtime current here, or
  /// on the one current at the first `attach` if there is none yet.
  pub fn new(idle_grace: Duration) -> Self {
    Self {
      inner: Arc::new(RegistryInner {
        entries: Mutex::new(HashMap::new()),
        idle_grace,
        next_id: AtomicU64::new(1),
        runtime: Mutex::new(Handle::try_current().ok()),
      }),
    }
  }

  pub fn idle_grace(&self) -> Duration {
    self.inner.idle_grace
  }

  /// Attach `callback` to the subscription for `key`, creating it with `setup` if needed.
  ///
  /// `setup` runs at most once per active period of the key, outside the
  /// registry lock, and receives the [`Emitter`] it should feed updates into.
  /// Attaching during the idle grace period cancels the pending teardown and
  /// reuses the existing subscription without calling `setup`.
  ///
  /// If `setup` panics the key is left inactive and the panic propagates, so
  /// the next `attach` runs setup again.
  pub fn attach<S, F>(&self, key: &str, setup: S, callback: F) -> Subscription
  where
    S: FnOnce(Emitter<T>) -> Teardown,
    F: Fn(&T) + Send + Sync + 'static,
  {
    let slot = Arc::new(Slot {
      id: self.inner.next_id(),
      callback: Arc::new(callback),
      active: AtomicBool::new(true),
      gate: Mutex::new(()),
    });
    self.inner.capture_runtime();

    let mut entries = lock(&self.inner.entries, SOURCE, "attach");
    if let Some(entry) = entries.get_mut(key) {
      if let Some(timer) = entry.idle_timer.take() {
        timer.handle.abort();
        debug!(key, "Cancelled idle teardown, reusing subscription");
      }
      entry.slots.push(Arc::clone(&slot));
      let generation = entry.generation;
      debug!(key, ref_count = entry.slots.len(), "Attached to existing subscription");
      drop(entries);
      return self.subscription(key, generation, slot);
    }

    let generation = self.inner.next_id();
    entries.insert(
      key.to_string(),
      ListenerEntry {
        generation,
        slots: vec![Arc::clone(&slot)],
        teardown: None,
        idle_timer: None,
      },
    );
    drop(entries);

    debug!(key, "Creating subscription");
    let emitter = Emitter {
      registry: Arc::downgrade(&self.inner),
      key: key.to_string(),
      generation,
    };
    let teardown = match catch_unwind(AssertUnwindSafe(|| setup(emitter))) {
      Ok(teardown) => teardown,
      Err(panic) => {
        error!(key, panic = panic_message(&*panic), "Subscription setup panicked");
        self.inner.abandon(key, generation);
        resume_unwind(panic);
      }
    };

    let orphaned = {
      let mut entries = lock(&self.inner.entries, SOURCE, "attach");
      match entries.get_mut(key) {
        Some(entry) if entry.generation == generation => {
          entry.teardown = Some(teardown);
          None
        }
        // Every caller left and the entry expired while setup was running
        _ => Some(teardown),
      }
    };
    if let Some(teardown) = orphaned {
      run_teardown(key, teardown);
    }

    self.subscription(key, generation, slot)
  }

  fn subscription(&self, key: &str, generation: u64, slot: Arc<Slot<T>>) -> Subscription {
    let registry = Arc::downgrade(&self.inner);
    let owned_key = key.to_string();
    let detach: Box<dyn FnOnce() + Send> = Box::new(move || {
      RegistryInner::detach(&registry, &owned_key, generation, &slot);
    });
    Subscription {
      key: key.to_string(),
      detach: Mutex::new(Some(detach)),
    }
  }

  /// Number of callers attached to `key`.
  pub fn ref_count(&self, key: &str) -> usize {
    lock(&self.inner.entries, SOURCE, "ref_count")
      .get(key)
      .map(|entry| entry.slots.len())
      .unwrap_or(0)
  }

  /// Whether a subscription exists for `key`, attached or idling.
  pub fn is_active(&self, key: &str) -> bool {
    lock(&self.inner.entries, SOURCE, "is_active").contains_key(key)
  }

  pub fn active_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = lock(&self.inner.entries, SOURCE, "active_keys")
      .keys()
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Tear every subscription down now, attached callers included.
  pub fn shutdown(&self) {
    let drained: Vec<(String, ListenerEntry<T>)> =
      lock(&self.inner.entries, SOURCE, "shutdown").drain().collect();

    for (key, entry) in drained {
      if let Some(timer) = entry.idle_timer {
        timer.handle.abort();
      }
      for slot in &entry.slots {
        slot.active.store(false, Ordering::Release);
      }
      if let Some(teardown) = entry.teardown {
        run_teardown(&key, teardown);
      }
    }
  }
}

impl<T> RegistryInner<T> {
  fn next_id(&self) -> u64 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  fn capture_runtime(&self) {
    let mut runtime = lock(&self.runtime, SOURCE, "capture_runtime");
    if runtime.is_none() {
      *runtime = Handle::try_current().ok();
    }
  }

  fn runtime(&self) -> Option<Handle> {
    lock(&self.runtime, SOURCE, "runtime").clone()
  }

  /// Drop the entry created for a setup that failed. Its callers never got a
  /// `Subscription`, so nothing else would remove them.
  fn abandon(&self, key: &str, generation: u64) {
    let mut entries = lock(&self.entries, SOURCE, "abandon");
    if entries.get(key).is_some_and(|entry| entry.generation == generation) {
      if let Some(entry) = entries.remove(key) {
        if let Some(timer) = entry.idle_timer {
          timer.handle.abort();
        }
        for slot in &entry.slots {
          slot.active.store(false, Ordering::Release);
        }
      }
    }
  }
}

impl<T: 'static> RegistryInner<T> {
  fn detach(registry: &Weak<Self>, key: &str, generation: u64, slot: &Arc<Slot<T>>) {
    slot.active.store(false, Ordering::Release);

    if let Some(inner) = registry.upgrade() {
      let mut entries = lock(&inner.entries, SOURCE, "detach");
      let mut orphaned = None;

      if let Some(entry) = entries.get_mut(key) {
        if entry.generation == generation {
          entry.slots.retain(|attached| attached.id != slot.id);
          debug!(key, ref_count = entry.slots.len(), "Detached from subscription");

          if entry.slots.is_empty() && !inner.arm_idle_timer(key, entry) {
            orphaned = entries.remove(key);
          }
        }
      }
      drop(entries);

      if let Some(teardown) = orphaned.and_then(|entry| entry.teardown) {
        run_teardown(key, teardown);
      }
    }

    // Wait out a delivery in progress, unless it is the one calling us
    if !is_delivering(slot.id) {
      drop(lock(&slot.gate, SOURCE, "detach"));
    }
  }

  /// Schedule the idle teardown on the registry's runtime. Returns false when
  /// no runtime was ever seen.
  fn arm_idle_timer(self: &Arc<Self>, key: &str, entry: &mut ListenerEntry<T>) -> bool {
    let runtime = match self.runtime().or_else(|| Handle::try_current().ok()) {
      Some(runtime) => runtime,
      None => {
        warn!(key, "No async runtime for the idle timer, tearing down immediately");
        return false;
      }
    };

    let token = self.next_id();
    let generation = entry.generation;
    let idle_grace = self.idle_grace;
    let registry = Arc::downgrade(self);
    let owned_key = key.to_string();

    let handle = runtime.spawn(async move {
      tokio::time::sleep(idle_grace).await;
      if let Some(inner) = registry.upgrade() {
        inner.expire(&owned_key, generation, token);
      }
    });

    if let Some(previous) = entry.idle_timer.replace(IdleTimer { token, handle }) {
      previous.handle.abort();
    }
    debug!(key, grace_secs = idle_grace.as_secs(), "Armed idle teardown");
    true
  }

  fn expire(&self, key: &str, generation: u64, token: u64) {
    let mut entries = lock(&self.entries, SOURCE, "expire");
    let still_idle = entries.get(key).is_some_and(|entry| {
      entry.generation == generation
        && entry.slots.is_empty()
        && entry.idle_timer.as_ref().map(|timer| timer.token) == Some(token)
    });
    if !still_idle {
      return;
    }

    let entry = entries.remove(key);
    drop(entries);

    if let Some(teardown) = entry.and_then(|entry| entry.teardown) {
      run_teardown(key, teardown);
    }
  }
}

impl<T: 'static> Default for ListenerRegistry<T> {
  fn default() -> Self {
    Self::new(DEFAULT_IDLE_GRACE)
  }
}

impl<T> Clone for ListenerRegistry<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Feeds updates from one remote subscription to every attached caller.
///
/// An emitter belongs to a single active period of its key; once that period
/// ends, emitting through it delivers nothing.
pub struct Emitter<T> {
  registry: Weak<RegistryInner<T>>,
  key: String,
  generation: u64,
}

impl<T> Emitter<T> {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Deliver `value` to every attached callback, in attachment order.
  ///
  /// A panicking callback is logged and skipped. Returns how many callbacks
  /// received the value.
  pub fn emit(&self, value: &T) -> usize {
    let Some(inner) = self.registry.upgrade() else {
      return 0;
    };

    let slots = {
      let entries = lock(&inner.entries, SOURCE, "emit");
      match entries.get(&self.key) {
        Some(entry) if entry.generation == self.generation => entry.slots.clone(),
        _ => return 0,
      }
    };

    slots
      .iter()
      .filter(|slot| slot.deliver(&self.key, value))
      .count()
  }
}

impl<T> Clone for Emitter<T> {
  fn clone(&self) -> Self {
    Self {
      registry: Weak::clone(&self.registry),
      key: self.key.clone(),
      generation: self.generation,
    }
  }
}

impl<T> std::fmt::Debug for Emitter<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Emitter")
      .field("key", &self.key)
      .field("generation", &self.generation)
      .finish()
  }
}

/// Handle for one attached caller.
///
/// Detaching is idempotent and also happens on drop. Once `detach` returns,
/// the caller's callback is not invoked again.
pub struct Subscription {
  key: String,
  detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn is_attached(&self) -> bool {
    lock(&self.detach, SOURCE, "is_attached").is_some()
  }

  pub fn detach(&self) {
    let detach = lock(&self.detach, SOURCE, "subscription_detach").take();
    if let Some(detach) = detach {
      detach();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.detach();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("attached", &self.is_attached())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  const GRACE: Duration = Duration::from_secs(5 * 60);

  /// Stands in for a remote subscription.
  #[derive(Default)]
  struct Remote {
    setups: AtomicUsize,
    teardowns: AtomicUsize,
    emitter: Mutex<Option<Emitter<u32>>>,
  }

  impl Remote {
    fn setup(self: &Arc<Self>) -> impl FnOnce(Emitter<u32>) -> Teardown {
      let remote = Arc::clone(self);
      move |emitter| {
        remote.setups.fetch_add(1, Ordering::SeqCst);
        *remote.emitter.lock().unwrap() = Some(emitter);
        let remote = Arc::clone(&remote);
        Box::new(move || {
          remote.teardowns.fetch_add(1, Ordering::SeqCst);
        }) as Teardown
      }
    }

    fn push(&self, value: u32) -> usize {
      let emitter = self.emitter.lock().unwrap().clone();
      emitter.map(|emitter| emitter.emit(&value)).unwrap_or(0)
    }

    fn setups(&self) -> usize {
      self.setups.load(Ordering::SeqCst)
    }

    fn teardowns(&self) -> usize {
      self.teardowns.load(Ordering::SeqCst)
    }
  }

  fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&u32) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |value: &u32| sink.lock().unwrap().push(*value))
  }

  fn seen(log: &Arc<Mutex<Vec<u32>>>) -> Vec<u32> {
    log.lock().unwrap().clone()
  }

  #[tokio::test(start_paused = true)]
  async fn test_attach_dedups_remote_subscription() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());
    let other_setup = Arc::new(Remote::default());

    let (seen1, cb1) = recorder();
    let (seen2, cb2) = recorder();
    let _sub1 = registry.attach("requests_u1", remote.setup(), cb1);
    let _sub2 = registry.attach("requests_u1", other_setup.setup(), cb2);

    assert_eq!(remote.setups() + other_setup.setups(), 1);
    assert_eq!(registry.ref_count("requests_u1"), 2);

    assert_eq!(remote.push(1), 2);
    assert_eq!(remote.push(2), 2);
    assert_eq!(seen(&seen1), vec![1, 2]);
    assert_eq!(seen(&seen2), vec![1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fan_out_follows_attachment_order() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut subs = Vec::new();
    for caller in 0..3 {
      let order = Arc::clone(&order);
      subs.push(registry.attach("k", remote.setup(), move |_: &u32| {
        order.lock().unwrap().push(caller);
      }));
    }

    remote.push(7);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_teardown_waits_for_idle_grace() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());

    let sub1 = registry.attach("k", remote.setup(), |_: &u32| {});
    let sub2 = registry.attach("k", remote.setup(), |_: &u32| {});
    sub1.detach();
    sub2.detach();
    assert_eq!(registry.ref_count("k"), 0);
    assert!(registry.is_active("k"));

    tokio::time::sleep(GRACE - Duration::from_secs(1)).await;
    assert_eq!(remote.teardowns(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(remote.teardowns(), 1);
    assert!(!registry.is_active("k"));
    assert_eq!(remote.push(1), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reattach_during_grace_reuses_subscription() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());

    registry.attach("k", remote.setup(), |_: &u32| {}).detach();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let (seen_again, cb) = recorder();
    let _sub = registry.attach("k", remote.setup(), cb);
    tokio::time::sleep(GRACE * 2).await;

    assert_eq!(remote.setups(), 1);
    assert_eq!(remote.teardowns(), 0);
    assert_eq!(remote.push(3), 1);
    assert_eq!(seen(&seen_again), vec![3]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeated_idle_cycles_tear_down_once() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());

    registry.attach("k", remote.setup(), |_: &u32| {}).detach();
    tokio::time::sleep(GRACE / 2).await;
    registry.attach("k", remote.setup(), |_: &u32| {}).detach();

    // The first timer would have fired here
    tokio::time::sleep(GRACE / 2 + Duration::from_secs(1)).await;
    assert_eq!(remote.teardowns(), 0);

    tokio::time::sleep(GRACE / 2).await;
    assert_eq!(remote.teardowns(), 1);
    assert_eq!(remote.setups(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_key_recreated_after_teardown() {
    let registry = ListenerRegistry::new(GRACE);
    let first = Arc::new(Remote::default());
    let second = Arc::new(Remote::default());

    registry.attach("k", first.setup(), |_: &u32| {}).detach();
    tokio::time::sleep(GRACE + Duration::from_secs(1)).await;
    assert_eq!(first.teardowns(), 1);

    let (seen_new, cb) = recorder();
    let _sub = registry.attach("k", second.setup(), cb);
    assert_eq!(second.setups(), 1);

    // The torn-down subscription's emitter no longer reaches anyone
    assert_eq!(first.push(1), 0);
    assert_eq!(second.push(2), 1);
    assert_eq!(seen(&seen_new), vec![2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_detach_is_idempotent() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());

    let sub1 = registry.attach("k", remote.setup(), |_: &u32| {});
    let _sub2 = registry.attach("k", remote.setup(), |_: &u32| {});

    sub1.detach();
    sub1.detach();
    assert!(!sub1.is_attached());
    assert_eq!(registry.ref_count("k"), 1);

    drop(sub1);
    assert_eq!(registry.ref_count("k"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_delivery_after_detach() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());
    let (seen1, cb1) = recorder();
    let (seen2, cb2) = recorder();

    let sub1 = registry.attach("k", remote.setup(), cb1);
    let _sub2 = registry.attach("k", remote.setup(), cb2);
    remote.push(1);
    sub1.detach();
    assert_eq!(remote.push(2), 1);

    assert_eq!(seen(&seen1), vec![1]);
    assert_eq!(seen(&seen2), vec![1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_detaches() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());

    {
      let _sub = registry.attach("k", remote.setup(), |_: &u32| {});
      assert_eq!(registry.ref_count("k"), 1);
    }
    assert_eq!(registry.ref_count("k"), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_callback_is_isolated() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());
    let (seen_after, cb) = recorder();

    let _bad = registry.attach("k", remote.setup(), |value: &u32| {
      if *value == 1 {
        panic!("bad update");
      }
    });
    let _good = registry.attach("k", remote.setup(), cb);

    assert_eq!(remote.push(1), 2);
    assert_eq!(remote.push(2), 2);
    assert_eq!(seen(&seen_after), vec![1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_detach_from_inside_callback() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());
    let holder: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));

    let sub = {
      let holder = Arc::clone(&holder);
      let calls = Arc::clone(&calls);
      registry.attach("k", remote.setup(), move |_: &u32| {
        calls.fetch_add(1, Ordering::SeqCst);
        if let Some(sub) = holder.lock().unwrap().as_ref() {
          sub.detach();
        }
      })
    };
    *holder.lock().unwrap() = Some(sub);

    remote.push(1);
    remote.push(2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.ref_count("k"), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_setup_may_emit_initial_value() {
    let registry = ListenerRegistry::new(GRACE);
    let (seen_first, cb) = recorder();

    let _sub = registry.attach(
      "k",
      |emitter: Emitter<u32>| {
        emitter.emit(&42);
        Box::new(|| {}) as Teardown
      },
      cb,
    );

    assert_eq!(seen(&seen_first), vec![42]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_tears_everything_down() {
    let registry = ListenerRegistry::new(GRACE);
    let a = Arc::new(Remote::default());
    let b = Arc::new(Remote::default());
    let (seen_a, cb) = recorder();

    let sub = registry.attach("a", a.setup(), cb);
    registry.attach("b", b.setup(), |_: &u32| {}).detach();
    assert_eq!(registry.active_keys(), vec!["a", "b"]);

    registry.shutdown();
    assert_eq!((a.teardowns(), b.teardowns()), (1, 1));
    assert!(registry.active_keys().is_empty());
    assert_eq!(a.push(1), 0);
    assert!(seen(&seen_a).is_empty());

    // Detaching afterwards is harmless
    sub.detach();
    tokio::time::sleep(GRACE * 2).await;
    assert_eq!(b.teardowns(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_setup_leaves_key_inactive() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());

    let attempt = catch_unwind(AssertUnwindSafe(|| {
      registry.attach(
        "k",
        |_: Emitter<u32>| -> Teardown { panic!("connect failed") },
        |_: &u32| {},
      )
    }));
    assert!(attempt.is_err());
    assert!(!registry.is_active("k"));
    assert_eq!(registry.ref_count("k"), 0);

    let (seen_retry, cb) = recorder();
    let sub = registry.attach("k", remote.setup(), cb);
    assert_eq!(remote.setups(), 1);
    assert_eq!(registry.ref_count("k"), 1);
    assert_eq!(remote.push(5), 1);
    assert_eq!(seen(&seen_retry), vec![5]);

    sub.detach();
    assert_eq!(registry.ref_count("k"), 0);
    tokio::time::sleep(GRACE + Duration::from_secs(1)).await;
    assert_eq!(remote.teardowns(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_detach_on_plain_thread_waits_for_grace() {
    let grace = Duration::from_millis(200);
    let registry = ListenerRegistry::new(grace);
    let remote = Arc::new(Remote::default());

    let sub = registry.attach("k", remote.setup(), |_: &u32| {});
    std::thread::spawn(move || drop(sub)).join().unwrap();

    assert_eq!(remote.teardowns(), 0);
    assert!(registry.is_active("k"));

    tokio::time::sleep(grace * 5).await;
    assert_eq!(remote.teardowns(), 1);
    assert!(!registry.is_active("k"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_no_delivery_after_detach_from_another_thread() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());
    let detached = Arc::new(AtomicBool::new(false));
    let delivered = Arc::new(AtomicUsize::new(0));
    let late = Arc::new(AtomicUsize::new(0));

    let sub = {
      let (detached, delivered, late) = (Arc::clone(&detached), Arc::clone(&delivered), Arc::clone(&late));
      registry.attach("k", remote.setup(), move |_: &u32| {
        delivered.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
        if detached.load(Ordering::SeqCst) {
          late.fetch_add(1, Ordering::SeqCst);
        }
      })
    };
    let _keep = registry.attach("k", remote.setup(), |_: &u32| {});

    let stop = Arc::new(AtomicBool::new(false));
    let emitting = {
      let (remote, stop) = (Arc::clone(&remote), Arc::clone(&stop));
      tokio::task::spawn_blocking(move || {
        let mut value = 0u32;
        while !stop.load(Ordering::SeqCst) {
          remote.push(value);
          value = value.wrapping_add(1);
        }
      })
    };

    while delivered.load(Ordering::SeqCst) < 100 {
      tokio::task::yield_now().await;
    }

    let flag = Arc::clone(&detached);
    std::thread::spawn(move || {
      sub.detach();
      flag.store(true, Ordering::SeqCst);
    })
    .join()
    .unwrap();
    let at_detach = delivered.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.store(true, Ordering::SeqCst);
    emitting.await.unwrap();

    assert_eq!(late.load(Ordering::SeqCst), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), at_detach);
  }

  #[tokio::test(start_paused = true)]
  async fn test_nested_emit_skips_running_callback() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());
    let (seen_a, record_a) = recorder();
    let (seen_b, record_b) = recorder();

    let _a = {
      let source = Arc::clone(&remote);
      registry.attach("k", remote.setup(), move |value: &u32| {
        record_a(value);
        if *value == 1 {
          source.push(2);
        }
      })
    };
    let _b = registry.attach("k", remote.setup(), record_b);

    assert_eq!(remote.push(1), 2);
    assert_eq!(seen(&seen_a), vec![1]);
    assert_eq!(seen(&seen_b), vec![2, 1]);
  }

  #[test]
  fn test_without_runtime_tears_down_immediately() {
    let registry = ListenerRegistry::new(GRACE);
    let remote = Arc::new(Remote::default());

    let sub = registry.attach("k", remote.setup(), |_: &u32| {});
    sub.detach();

    assert_eq!(remote.teardowns(), 1);
    assert!(!registry.is_active("k"));
  }
}
