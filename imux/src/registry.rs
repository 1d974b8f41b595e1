//! Device registry
//!
//! In-memory table of attached devices. Every tracked device owns a cancellation token
//! derived from the token it was added with; removing the device cancels it, which is
//! how relays and DTX connections bound to the device learn that it went away.
//!
//! Listener callbacks are invoked outside the state lock but under a separate dispatch
//! lock, so all listeners observe add and remove events in the exact order the registry
//! applied them. Callbacks may read the registry but must not add, remove or subscribe
//! from inside a callback, and must not block.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{ImuxError, usbmuxd::DeviceEntry, util::lock};

/// Responds to devices being added to and removed from a [`Registry`]
pub trait DeviceListener: Send + Sync {
    fn on_device_added(&self, token: &CancellationToken, device: &DeviceEntry);
    fn on_device_removed(&self, token: &CancellationToken, device: &DeviceEntry);
}

struct FnListener<A, R> {
    added: A,
    removed: R,
}

impl<A, R> DeviceListener for FnListener<A, R>
where
    A: Fn(&CancellationToken, &DeviceEntry) + Send + Sync,
    R: Fn(&CancellationToken, &DeviceEntry) + Send + Sync,
{
    fn on_device_added(&self, token: &CancellationToken, device: &DeviceEntry) {
        (self.added)(token, device)
    }

    fn on_device_removed(&self, token: &CancellationToken, device: &DeviceEntry) {
        (self.removed)(token, device)
    }
}

/// Builds a listener from two closures
pub fn listener_fn<A, R>(added: A, removed: R) -> Arc<dyn DeviceListener>
where
    A: Fn(&CancellationToken, &DeviceEntry) + Send + Sync + 'static,
    R: Fn(&CancellationToken, &DeviceEntry) + Send + Sync + 'static,
{
    Arc::new(FnListener { added, removed })
}

struct Tracked {
    entry: DeviceEntry,
    token: CancellationToken,
}

#[derive(Default)]
struct State {
    devices: Vec<Tracked>,
    properties: HashMap<(u32, String), plist::Value>,
    listeners: Vec<(u64, Arc<dyn DeviceListener>)>,
    next_listener: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    dispatch: Mutex<()>,
}

enum Event {
    Added(CancellationToken, DeviceEntry),
    Removed(CancellationToken, DeviceEntry),
}

/// Cheaply cloneable handle to a shared device table
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("devices", &self.devices())
            .finish()
    }
}

/// Keeps a listener registered; dropping it unregisters
#[must_use = "the listener is unregistered when the subscription is dropped"]
pub struct Subscription {
    registry: Weak<Inner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            let mut state = lock(&inner.state);
            state.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn dispatch(&self, listeners: &[Arc<dyn DeviceListener>], events: Vec<Event>) {
        for event in events {
            for l in listeners {
                match &event {
                    Event::Added(token, entry) => l.on_device_added(token, entry),
                    Event::Removed(token, entry) => l.on_device_removed(token, entry),
                }
            }
        }
    }

    fn snapshot_listeners(state: &State) -> Vec<Arc<dyn DeviceListener>> {
        state.listeners.iter().map(|(_, l)| l.clone()).collect()
    }

    /// Tracks a device, returning its cancellation token
    ///
    /// Adding an entry equal to a tracked one is a no-op that returns the existing
    /// token. An entry that shares its serial or ID with a different tracked entry
    /// means the upstream reassigned IDs without telling us: the stale entry is
    /// cancelled and removed before the new one is added.
    pub fn add_device(&self, parent: &CancellationToken, entry: DeviceEntry) -> CancellationToken {
        let _order = lock(&self.inner.dispatch);
        let mut state = lock(&self.inner.state);

        if let Some(t) = state.devices.iter().find(|t| t.entry == entry) {
            return t.token.clone();
        }

        let mut events = Vec::new();
        let mut i = 0;
        while i < state.devices.len() {
            let t = &state.devices[i];
            if t.entry.serial() == entry.serial() || t.entry.device_id == entry.device_id {
                error!(
                    "Registry conflict: device {} ({}) is already tracked as {} ({}), replacing",
                    entry.device_id,
                    entry.serial(),
                    t.entry.device_id,
                    t.entry.serial()
                );
                let stale = state.devices.remove(i);
                stale.token.cancel();
                state.properties.retain(|(id, _), _| *id != stale.entry.device_id);
                events.push(Event::Removed(stale.token, stale.entry));
            } else {
                i += 1;
            }
        }

        info!(
            "Adding new device, id: {}, udid: {}",
            entry.device_id,
            entry.serial()
        );
        let token = parent.child_token();
        state.devices.push(Tracked {
            entry: entry.clone(),
            token: token.clone(),
        });
        events.push(Event::Added(token.clone(), entry));

        let listeners = Self::snapshot_listeners(&state);
        drop(state);
        self.dispatch(&listeners, events);
        token
    }

    /// Removes every device whose ID or serial matches `entry`, cancelling their tokens
    ///
    /// Returns how many devices were removed.
    pub fn remove_device(&self, entry: &DeviceEntry) -> usize {
        self.remove_where(|t| {
            if t.device_id == entry.device_id {
                return true;
            }
            if t.serial() == entry.serial() {
                warn!(
                    "Removing device {} by serial {}, event carried ID {}",
                    t.device_id,
                    t.serial(),
                    entry.device_id
                );
                return true;
            }
            false
        })
    }

    /// Removes the device with this ID, as reported by a `Detached` event
    pub fn remove_device_by_id(&self, device_id: u32) -> usize {
        self.remove_where(|t| t.device_id == device_id)
    }

    /// Removes and cancels every device, used when the upstream transport is lost
    pub fn remove_all(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where(&self, mut pred: impl FnMut(&DeviceEntry) -> bool) -> usize {
        let _order = lock(&self.inner.dispatch);
        let mut state = lock(&self.inner.state);

        let mut events = Vec::new();
        let mut i = 0;
        while i < state.devices.len() {
            if pred(&state.devices[i].entry) {
                let removed = state.devices.remove(i);
                info!(
                    "Removing device, id: {}, udid: {}",
                    removed.entry.device_id,
                    removed.entry.serial()
                );
                removed.token.cancel();
                state
                    .properties
                    .retain(|(id, _), _| *id != removed.entry.device_id);
                events.push(Event::Removed(removed.token, removed.entry));
            } else {
                i += 1;
            }
        }

        let count = events.len();
        let listeners = Self::snapshot_listeners(&state);
        drop(state);
        self.dispatch(&listeners, events);
        count
    }

    /// Registers a listener and replays an add event for every tracked device
    ///
    /// The replay completes before any later add or remove reaches the listener.
    pub fn listen(&self, listener: Arc<dyn DeviceListener>) -> Subscription {
        let _order = lock(&self.inner.dispatch);
        let mut state = lock(&self.inner.state);

        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((id, listener.clone()));
        let replay: Vec<Event> = state
            .devices
            .iter()
            .map(|t| Event::Added(t.token.clone(), t.entry.clone()))
            .collect();
        drop(state);

        self.dispatch(&[listener], replay);
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn device(&self, device_id: u32) -> Option<DeviceEntry> {
        let state = lock(&self.inner.state);
        state
            .devices
            .iter()
            .find(|t| t.entry.device_id == device_id)
            .map(|t| t.entry.clone())
    }

    pub fn device_by_serial(&self, serial: &str) -> Option<DeviceEntry> {
        let state = lock(&self.inner.state);
        state
            .devices
            .iter()
            .find(|t| t.entry.serial() == serial)
            .map(|t| t.entry.clone())
    }

    /// All tracked devices in the order they were added
    pub fn devices(&self) -> Vec<DeviceEntry> {
        let state = lock(&self.inner.state);
        state.devices.iter().map(|t| t.entry.clone()).collect()
    }

    /// The first device that was added
    pub fn default_device(&self) -> Result<DeviceEntry, ImuxError> {
        let state = lock(&self.inner.state);
        match state.devices.first() {
            Some(t) => Ok(t.entry.clone()),
            None => Err(ImuxError::DeviceNotFound),
        }
    }

    pub fn device_token(&self, device_id: u32) -> Option<CancellationToken> {
        let state = lock(&self.inner.state);
        state
            .devices
            .iter()
            .find(|t| t.entry.device_id == device_id)
            .map(|t| t.token.clone())
    }

    /// Attaches an arbitrary value to a device ID
    ///
    /// Properties are dropped together with the device.
    pub fn set_device_property(&self, device_id: u32, key: impl Into<String>, value: plist::Value) {
        let mut state = lock(&self.inner.state);
        state.properties.insert((device_id, key.into()), value);
    }

    pub fn device_property(&self, device_id: u32, key: &str) -> Option<plist::Value> {
        let state = lock(&self.inner.state);
        state.properties.get(&(device_id, key.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
