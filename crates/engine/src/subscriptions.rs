//! Subscription registry
//!
//! Every subscription is recorded in an owning-thread registry that outlives
//! the owning handle. While a handle is open, each entry may carry a live
//! registration (an engine live query, or whatever a custom registration
//! returned). Blocking maintenance tears the live registrations down; the
//! entries stay and are registered again once the handle is back.
//!
//! Deliveries are jobs posted to the owning thread. Each entry carries an
//! epoch bumped on every (re-)registration and teardown, so a delivery queued
//! for a torn-down registration is dropped.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::thread::{self, ThreadId};

use custodian_core::{
    AccessResult, ChangeSet, LiveQuery, Query, RecordId, ResultSet, StoreHandle, Waker,
};
use tracing::{debug, warn};

use crate::access::StoreAccess;
use crate::owner::{owner_state, OwnerState};
use crate::pool::Mailbox;

/// Callback receiving query results and the change set (`None` for the
/// initial population and for reset notifications)
pub type ChangeCallback = Box<dyn FnMut(&ResultSet, Option<&ChangeSet>) + Send>;

/// Tears down a custom registration
pub type Teardown = Box<dyn FnOnce()>;

/// Custom registration, run on the owning thread against the owning handle
/// every time the handle is (re-)established
pub type CustomRegistration =
    Box<dyn FnMut(&StoreAccess, &dyn StoreHandle) -> Option<Teardown> + Send>;

/// Identity of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Subscription request as it travels to the owning thread
pub(crate) enum NewSubscription {
    Query {
        query: Query,
        callback: ChangeCallback,
        resets: bool,
    },
    Custom(CustomRegistration),
}

impl NewSubscription {
    fn into_kind(self) -> EntryKind {
        match self {
            NewSubscription::Query {
                query,
                callback,
                resets,
            } => EntryKind::Query {
                query,
                callback: Rc::new(RefCell::new(callback)),
                resets,
            },
            NewSubscription::Custom(register) => EntryKind::Custom {
                register: Rc::new(RefCell::new(register)),
            },
        }
    }
}

enum EntryKind {
    Query {
        query: Query,
        callback: Rc<RefCell<ChangeCallback>>,
        /// Receives an empty result set when a blocking operation starts
        resets: bool,
    },
    Custom {
        register: Rc<RefCell<CustomRegistration>>,
    },
}

enum Live {
    Query(Box<dyn LiveQuery>),
    Custom(Option<Teardown>),
}

impl Live {
    fn teardown(self) {
        match self {
            Live::Query(live) => drop(live),
            Live::Custom(Some(teardown)) => teardown(),
            Live::Custom(None) => {}
        }
    }
}

struct Entry {
    kind: EntryKind,
    live: Option<Live>,
    epoch: u64,
}

/// Owning-thread registry of all subscriptions
#[derive(Default)]
pub(crate) struct Registry {
    entries: BTreeMap<SubscriptionId, Entry>,
    /// Tokens disposed before their registration job ran
    disposed_early: BTreeSet<SubscriptionId>,
}

impl Registry {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, id: SubscriptionId, kind: EntryKind) -> bool {
        if self.disposed_early.remove(&id) {
            return false;
        }
        self.entries.insert(
            id,
            Entry {
                kind,
                live: None,
                epoch: 0,
            },
        );
        true
    }
}

/// Add a subscription on the owning thread and register it if possible.
pub(crate) fn add(access: &StoreAccess, id: SubscriptionId, request: NewSubscription) {
    let Some(state) = owner_state() else {
        return;
    };
    if !state.registry.borrow_mut().insert(id, request.into_kind()) {
        debug!(target: "custodian::subscriptions", %id, "subscription disposed before registration");
        state.metrics.subscription_removed();
        return;
    }
    // Recorded only: registration happens when the block is released
    if state.blocked.borrow().is_some() || state.sending_resets.get() {
        return;
    }
    if let Err(e) = access.ensure_owning_handle(&state) {
        warn!(target: "custodian::subscriptions", %id, error = %e, "deferring subscription registration");
        return;
    }
    register_pending(access, &state);
}

/// Register every entry that has no live registration.
pub(crate) fn register_pending(access: &StoreAccess, state: &OwnerState) {
    let Some(handle) = state.handle.borrow().clone() else {
        return;
    };
    let pending: Vec<SubscriptionId> = state
        .registry
        .borrow()
        .entries
        .iter()
        .filter(|(_, entry)| entry.live.is_none())
        .map(|(id, _)| *id)
        .collect();
    for id in pending {
        register(access, state, &*handle, id);
    }
}

enum Registration {
    Query(Query, u64),
    Custom(Rc<RefCell<CustomRegistration>>),
}

fn register(access: &StoreAccess, state: &OwnerState, handle: &dyn StoreHandle, id: SubscriptionId) {
    let registration = {
        let mut registry = state.registry.borrow_mut();
        let Some(entry) = registry.entries.get_mut(&id) else {
            return;
        };
        debug_assert!(entry.live.is_none(), "{} is already registered", id);
        if entry.live.is_some() {
            return;
        }
        entry.epoch += 1;
        match &entry.kind {
            EntryKind::Query { query, .. } => Registration::Query(query.clone(), entry.epoch),
            EntryKind::Custom { register } => Registration::Custom(Rc::clone(register)),
        }
    };

    match registration {
        Registration::Query(query, epoch) => {
            let live = match handle.observe(query, delivery_waker(&state.mailbox, id, epoch)) {
                Ok(live) => live,
                Err(e) => {
                    warn!(target: "custodian::subscriptions", %id, error = %e, "failed to observe query");
                    return;
                }
            };
            if let Some(entry) = state.registry.borrow_mut().entries.get_mut(&id) {
                entry.live = Some(Live::Query(live));
            }
            // Initial population
            post_delivery(&state.mailbox, id, epoch);
        }
        Registration::Custom(register) => {
            // Called outside the registry borrow: user code may subscribe
            let teardown = match register.try_borrow_mut() {
                Ok(mut register) => (*register)(access, handle),
                Err(_) => {
                    warn!(target: "custodian::subscriptions", %id, "custom registration re-entered");
                    return;
                }
            };
            let mut registry = state.registry.borrow_mut();
            match registry.entries.get_mut(&id) {
                Some(entry) => entry.live = Some(Live::Custom(teardown)),
                None => {
                    drop(registry);
                    // Disposed while registering
                    if let Some(teardown) = teardown {
                        teardown();
                    }
                }
            }
        }
    }
}

/// Tear down every live registration, keeping the entries.
pub(crate) fn teardown_lives(state: &OwnerState) {
    let lives: Vec<Live> = {
        let mut registry = state.registry.borrow_mut();
        registry
            .entries
            .values_mut()
            .filter_map(|entry| {
                entry.epoch += 1;
                entry.live.take()
            })
            .collect()
    };
    let count = lives.len();
    for live in lives {
        live.teardown();
    }
    if count > 0 {
        debug!(target: "custodian::subscriptions", count, "tore down live registrations");
    }
}

/// Remove a subscription and tear down its registration.
pub(crate) fn remove(state: &OwnerState, id: SubscriptionId) -> bool {
    let entry = {
        let mut registry = state.registry.borrow_mut();
        let entry = registry.entries.remove(&id);
        if entry.is_none() {
            registry.disposed_early.insert(id);
        }
        entry
    };
    match entry {
        Some(entry) => {
            if let Some(live) = entry.live {
                live.teardown();
            }
            state.metrics.subscription_removed();
            true
        }
        None => false,
    }
}

/// Remove every subscription, tearing down live registrations.
pub(crate) fn clear(state: &OwnerState) {
    teardown_lives(state);
    let mut registry = state.registry.borrow_mut();
    let removed = registry.entries.len();
    registry.entries.clear();
    registry.disposed_early.clear();
    drop(registry);
    for _ in 0..removed {
        state.metrics.subscription_removed();
    }
}

/// Deliver an empty result set to every entry that asked for resets.
///
/// The owning handle cannot be retrieved while this runs.
pub(crate) fn send_resets(state: &OwnerState) {
    let callbacks: Vec<Rc<RefCell<ChangeCallback>>> = state
        .registry
        .borrow()
        .entries
        .values()
        .filter_map(|entry| match &entry.kind {
            EntryKind::Query {
                callback,
                resets: true,
                ..
            } => Some(Rc::clone(callback)),
            _ => None,
        })
        .collect();

    let _flag = FlagGuard::set(&state.sending_resets);
    let empty = ResultSet::empty();
    for callback in callbacks {
        match callback.try_borrow_mut() {
            Ok(mut callback) => (*callback)(&empty, None),
            Err(_) => debug!(target: "custodian::subscriptions", "skipping reset for a callback already running"),
        }
    }
}

/// Sets a flag for the guard's lifetime
struct FlagGuard<'a>(&'a Cell<bool>);

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

fn delivery_waker(mailbox: &Mailbox, id: SubscriptionId, epoch: u64) -> Waker {
    let mailbox = mailbox.clone();
    std::sync::Arc::new(move || post_delivery(&mailbox, id, epoch))
}

fn post_delivery(mailbox: &Mailbox, id: SubscriptionId, epoch: u64) {
    // Fails only after dispose, when nobody is listening
    let _ = mailbox.post(move || deliver(id, epoch));
}

/// Poll a live query and hand any change to its callback. Owning thread only.
fn deliver(id: SubscriptionId, epoch: u64) {
    let Some(state) = owner_state() else {
        return;
    };
    let (callback, notification) = {
        let Ok(mut registry) = state.registry.try_borrow_mut() else {
            warn!(target: "custodian::subscriptions", %id, "registry busy; delivery dropped");
            return;
        };
        let Some(entry) = registry.entries.get_mut(&id) else {
            return;
        };
        if entry.epoch != epoch {
            return;
        }
        let (Some(Live::Query(live)), EntryKind::Query { callback, .. }) =
            (&mut entry.live, &entry.kind)
        else {
            return;
        };
        match live.poll() {
            Ok(Some(notification)) => (Rc::clone(callback), notification),
            Ok(None) => return,
            Err(e) => {
                warn!(target: "custodian::subscriptions", %id, error = %e, "live query poll failed");
                return;
            }
        }
    };

    match callback.try_borrow_mut() {
        Ok(mut callback) => (*callback)(&notification.results, notification.changes.as_ref()),
        Err(_) => warn!(target: "custodian::subscriptions", %id, "callback re-entered; delivery dropped"),
    };
}

/// Disposal token for a subscription
///
/// Disposing (explicitly or by dropping) removes the subscription and tears
/// down its registration on the owning thread. Callable from any thread.
#[must_use = "dropping a Subscription disposes it"]
pub struct Subscription {
    id: SubscriptionId,
    mailbox: Mailbox,
    owner: ThreadId,
    disposed: bool,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, mailbox: Mailbox, owner: ThreadId) -> Self {
        Self {
            id,
            mailbox,
            owner,
            disposed: false,
        }
    }

    /// Identity of this subscription
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Dispose the subscription.
    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let id = self.id;
        let job = move || {
            if let Some(state) = owner_state() {
                remove(&state, id);
            }
        };
        if thread::current().id() == self.owner {
            job();
        } else {
            // Fails only after dispose, when the registry is already gone
            let _ = self.mailbox.post(job);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl StoreAccess {
    /// Subscribe to a query.
    ///
    /// `on_change` runs on the owning thread: first with the initial results
    /// (`None` change set), then with every change. When a blocking operation
    /// starts it receives an empty result set (`None` change set), and the
    /// initial population again once the block is released.
    ///
    /// Callable from any thread; off the owning thread the registration is
    /// posted.
    pub fn subscribe<F>(&self, query: Query, on_change: F) -> AccessResult<Subscription>
    where
        F: FnMut(&ResultSet, Option<&ChangeSet>) + Send + 'static,
    {
        self.add_subscription(NewSubscription::Query {
            query,
            callback: Box::new(on_change),
            resets: true,
        })
    }

    /// Register a custom subscription.
    ///
    /// `register` runs on the owning thread against the owning handle, now and
    /// again after every blocking operation. The teardown it returns runs
    /// before the owning handle goes away and when the subscription is
    /// disposed.
    pub fn subscribe_custom<F>(&self, register: F) -> AccessResult<Subscription>
    where
        F: FnMut(&StoreAccess, &dyn StoreHandle) -> Option<Teardown> + Send + 'static,
    {
        self.add_subscription(NewSubscription::Custom(Box::new(register)))
    }

    /// Watch one field of one record.
    ///
    /// `on_changed` runs on the owning thread with the current value (`None`
    /// when the record or field is absent), then again whenever the value
    /// changes.
    pub fn subscribe_to_field<F>(
        &self,
        kind: &str,
        id: RecordId,
        field: &str,
        mut on_changed: F,
    ) -> AccessResult<Subscription>
    where
        F: FnMut(Option<&serde_json::Value>) + Send + 'static,
    {
        let field = field.to_string();
        let query = Query::all(kind).filter(move |record| record.id == id);
        let mut last: Option<Option<serde_json::Value>> = None;
        let callback = move |results: &ResultSet, _: Option<&ChangeSet>| {
            let current = results.iter().next().and_then(|r| r.field(&field)).cloned();
            if last.as_ref() != Some(&current) {
                on_changed(current.as_ref());
                last = Some(current);
            }
        };
        self.add_subscription(NewSubscription::Query {
            query,
            callback: Box::new(callback),
            resets: false,
        })
    }

    fn add_subscription(&self, request: NewSubscription) -> AccessResult<Subscription> {
        self.ensure_not_disposed()?;
        let inner = self.inner();
        let id = SubscriptionId::new(inner.next_subscription_id());

        if self.is_owning_thread() {
            add(self, id, request);
        } else {
            let access = self.clone();
            inner.owner.post(move || add(&access, id, request))?;
        }
        inner.metrics.subscription_added();
        Ok(Subscription::new(id, inner.owner.mailbox(), inner.owner.thread_id()))
    }
}
