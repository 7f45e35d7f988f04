//! Copy-on-write listener sets.

use std::any::{Any, type_name};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::ReentrantMutex;
use tracing::error;

/// Identifies one registration in a [`ListenerRegistry`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

/// A thread-safe set of listeners that is cheap to iterate and rarely modified.
///
/// Every mutation builds a new immutable snapshot of the set and publishes it atomically,
/// so iteration via [`for_each()`][Self::for_each] never takes a lock and never observes
/// a half-applied change. Mutations are serialized by a lock that is reentrant, so a
/// listener may add or remove listeners (including itself) while being notified.
///
/// An optional change callback is invoked synchronously after every mutation with the new
/// number of listeners. Owners use it to stop expensive background work when the last
/// listener leaves. The callback runs while mutations are locked out, so it must never wait
/// on a lock that is held while listeners are being notified.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use tickwatch::ListenerRegistry;
///
/// let registry = ListenerRegistry::<dyn Fn(u32) + Send + Sync>::new();
/// let seen = Arc::new(AtomicUsize::new(0));
///
/// let seen_clone = Arc::clone(&seen);
/// let handle = registry.add(Arc::new(move |x| {
///     seen_clone.fetch_add(x as usize, Ordering::Relaxed);
/// }));
///
/// registry.for_each(|listener| listener(5));
/// assert_eq!(seen.load(Ordering::Relaxed), 5);
///
/// // Dropping the handle removes the listener.
/// drop(handle);
/// assert!(registry.is_empty());
/// ```
pub struct ListenerRegistry<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    core: Arc<RegistryCore<L>>,
}

type ChangeCallback = Box<dyn Fn(usize) + Send + Sync>;

struct RegistryCore<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    // Readers take the whole snapshot; writers replace it under `write_lock`.
    entries: ArcSwap<Vec<Entry<L>>>,
    write_lock: ReentrantMutex<()>,
    next_id: AtomicU64,
    on_change: Option<ChangeCallback>,
}

struct Entry<L>
where
    L: ?Sized,
{
    id: ListenerId,
    listener: Arc<L>,
}

impl<L> Clone for Entry<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<L> ListenerRegistry<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    /// Creates an empty registry without a change callback.
    #[must_use]
    pub fn new() -> Self {
        Self::from_callback(None)
    }

    /// Creates an empty registry that reports every change in population to `on_change`.
    ///
    /// The callback runs on the thread that performed the mutation, after the new listener
    /// set has been published, while mutations from other threads are held back.
    #[must_use]
    pub fn with_change_callback<F>(on_change: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        Self::from_callback(Some(Box::new(on_change)))
    }

    fn from_callback(on_change: Option<ChangeCallback>) -> Self {
        Self {
            core: Arc::new(RegistryCore {
                entries: ArcSwap::from_pointee(Vec::new()),
                write_lock: ReentrantMutex::new(()),
                next_id: AtomicU64::new(0),
                on_change,
            }),
        }
    }

    /// Registers a listener. The listener stays registered until the returned handle
    /// is dropped or released.
    pub fn add(&self, listener: Arc<L>) -> ListenerHandle {
        let id = ListenerId(self.core.next_id.fetch_add(1, Ordering::Relaxed));

        {
            let _guard = self.core.write_lock.lock();

            let current = self.core.entries.load_full();
            let mut updated = Vec::with_capacity(current.len().saturating_add(1));
            updated.extend(current.iter().cloned());
            updated.push(Entry { id, listener });

            let len = updated.len();
            self.core.entries.store(Arc::new(updated));

            if let Some(on_change) = &self.core.on_change {
                on_change(len);
            }
        }

        let core: Arc<dyn RemoveListener> = Arc::clone(&self.core) as Arc<dyn RemoveListener>;

        ListenerHandle {
            registry: Some(Arc::downgrade(&core)),
            id,
        }
    }

    /// Removes a listener.
    ///
    /// Returns `false` if no such listener is registered, in which case nothing happens
    /// and the change callback is not invoked.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.core.remove_listener(id)
    }

    /// Invokes `action` once for every listener in the current snapshot.
    ///
    /// A panic raised by one listener is caught and logged; the remaining listeners are
    /// still notified and the panic does not propagate to the caller.
    pub fn for_each<F>(&self, mut action: F)
    where
        F: FnMut(&L),
    {
        // We hold the snapshot for the whole iteration, potentially a long time,
        // so we take a full reference instead of a short-lived guard.
        let entries = self.core.entries.load_full();

        for entry in entries.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| action(entry.listener.as_ref())));

            if let Err(payload) = result {
                error!(
                    listener = entry.id.0,
                    listener_type = type_name::<L>(),
                    message = panic_message(payload.as_ref()),
                    "listener panicked during notification"
                );
            }
        }
    }

    /// Runs `action` with the number of listeners while mutations are held back.
    ///
    /// Owners that start background work outside the change callback use this to confirm,
    /// race-free, that the population has not dropped to zero in the meantime.
    pub(crate) fn with_population<R>(&self, action: impl FnOnce(usize) -> R) -> R {
        let _guard = self.core.write_lock.lock();
        action(self.len())
    }

    /// The number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.entries.load().len()
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L> Default for ListenerRegistry<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<L> fmt::Debug for ListenerRegistry<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.len())
            .field("has_change_callback", &self.core.on_change.is_some())
            .finish_non_exhaustive()
    }
}

trait RemoveListener: Send + Sync {
    fn remove_listener(&self, id: ListenerId) -> bool;
}

impl<L> RemoveListener for RegistryCore<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    fn remove_listener(&self, id: ListenerId) -> bool {
        let _guard = self.write_lock.lock();

        let current = self.entries.load_full();

        if !current.iter().any(|entry| entry.id == id) {
            return false;
        }

        let updated = current
            .iter()
            .filter(|entry| entry.id != id)
            .cloned()
            .collect::<Vec<_>>();

        let len = updated.len();
        self.entries.store(Arc::new(updated));

        if let Some(on_change) = &self.on_change {
            on_change(len);
        }

        true
    }
}

/// Keeps a listener registered. Dropping the handle removes the listener.
///
/// If the registry is dropped first, the handle becomes inert.
#[must_use = "the listener is removed as soon as the handle is dropped"]
pub struct ListenerHandle {
    registry: Option<Weak<dyn RemoveListener>>,
    id: ListenerId,
}

impl ListenerHandle {
    /// The registration this handle controls.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener now. Equivalent to dropping the handle.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn release(self) {
        drop(self);
    }

    /// Gives up control of the registration without removing the listener.
    ///
    /// The listener can later be removed via [`ListenerRegistry::remove()`] using the
    /// returned identifier.
    pub fn detach(mut self) -> ListenerId {
        self.registry = None;
        self.id
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };

        if let Some(registry) = registry.upgrade() {
            registry.remove_listener(self.id);
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("attached", &self.registry.is_some())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
