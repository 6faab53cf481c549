use crate::*;
use registry::RegistryInner;

use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

/// Set in the reference count while the module is not accepting references:
/// until its load callback starts, for the duration of an unload or reload,
/// and once a failed load has drained.
const TEARDOWN: usize = 1 << (usize::BITS - 1);

struct ModuleMeta {
    description: String,
    flags: ModuleFlags,
}

impl ModuleMeta {
    fn of(image: &ModuleImage) -> Self {
        Self {
            description: image.module().description().to_string(),
            flags: image.module().flags(),
        }
    }
}

/// The registry's bookkeeping for one module.
pub struct ModuleRecord {
    name: String,
    meta: RwLock<ModuleMeta>,
    state: AtomicU8,
    refcount: AtomicUsize,
    pending_reload: AtomicBool,
    listener_holds: AtomicUsize,
    dependencies: Mutex<Vec<String>>,
    // The per-module lock. Lifecycle callbacks run while it is held.
    pub(crate) image: Mutex<Option<ModuleImage>>,
}

impl ModuleRecord {
    pub(crate) fn new(image: ModuleImage) -> Self {
        Self {
            name: image.module().name().to_string(),
            meta: RwLock::new(ModuleMeta::of(&image)),
            state: AtomicU8::new(ModuleState::Registered as u8),
            refcount: AtomicUsize::new(TEARDOWN),
            pending_reload: AtomicBool::new(false),
            listener_holds: AtomicUsize::new(0),
            dependencies: Mutex::new(Vec::new()),
            image: Mutex::new(Some(image)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> String {
        self.meta.read().description.clone()
    }

    pub fn flags(&self) -> ModuleFlags {
        self.meta.read().flags
    }

    // A reloaded image may describe itself differently.
    pub(crate) fn refresh_meta(&self, image: &ModuleImage) {
        *self.meta.write() = ModuleMeta::of(image);
    }

    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    // Only called with the module lock held.
    pub(crate) fn set_state(&self, state: ModuleState) {
        tracing::trace!(module = %self.name, %state, "module state change");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Number of live [`ModuleRef`]s.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst) & !TEARDOWN
    }

    pub fn pending_reload(&self) -> bool {
        self.pending_reload.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pending_reload(&self, pending: bool) {
        self.pending_reload.store(pending, Ordering::SeqCst);
    }

    pub fn listener_holds(&self) -> usize {
        self.listener_holds.load(Ordering::SeqCst)
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.dependencies.lock().clone()
    }

    pub(crate) fn add_dependency(&self, name: &str) {
        self.dependencies.lock().push(name.to_string());
    }

    pub(crate) fn remove_dependency(&self, name: &str) {
        let mut deps = self.dependencies.lock();
        match deps.iter().rposition(|d| d == name) {
            Some(pos) => {
                if pos + 1 != deps.len() {
                    tracing::warn!(module = %self.name, dependency = %name,
                        "dependencies released out of acquisition order");
                }
                deps.remove(pos);
            }
            None => {
                tracing::warn!(module = %self.name, dependency = %name, "released a dependency it never required");
            }
        }
    }

    pub(crate) fn take_dependencies(&self) -> Vec<String> {
        std::mem::take(&mut *self.dependencies.lock())
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.refcount.load(Ordering::SeqCst);
        loop {
            if current & TEARDOWN != 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    // Returns the count remaining after the decrement.
    fn release(&self) -> usize {
        let previous = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous & !TEARDOWN > 0, "module refcount underflow");
        (previous - 1) & !TEARDOWN
    }

    /// Atomically move from "no references" to "torn down". Fails if any
    /// reference is live or a teardown is already in progress.
    pub(crate) fn begin_teardown(&self) -> bool {
        self.refcount
            .compare_exchange(0, TEARDOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Start accepting references again. Only valid while no reference can
    /// exist, i.e. with the teardown marker set.
    pub(crate) fn end_teardown(&self) {
        let previous = self.refcount.swap(0, Ordering::SeqCst);
        debug_assert_eq!(previous, TEARDOWN);
    }

    /// Block until every live reference is gone, then set the teardown marker.
    ///
    /// Used when a load fails after other threads may already have taken
    /// references, e.g. connections accepted by a listener the module started.
    /// Their handlers are never cancelled, so this waits for them to finish.
    pub(crate) fn drain_references(&self) {
        let mut waited = false;
        while !self.begin_teardown() {
            if !waited {
                tracing::warn!(module = %self.name, refs = self.refcount(),
                    "waiting for references to drain before discarding module");
                waited = true;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("refcount", &self.refcount())
            .field("pending_reload", &self.pending_reload())
            .finish()
    }
}

/// Identifies a module without keeping it loaded.
///
/// Listeners keep one of these for their owning module; converting it into a
/// [`ModuleRef`] succeeds from the moment its load callback starts, and fails
/// once the module has started unloading.
#[derive(Clone)]
pub struct ModuleHandle {
    name: Arc<str>,
    record: Weak<ModuleRecord>,
    registry: Weak<RegistryInner>,
}

impl ModuleHandle {
    pub(crate) fn new(record: &Arc<ModuleRecord>, registry: Weak<RegistryInner>) -> Self {
        Self {
            name: Arc::from(record.name()),
            record: Arc::downgrade(record),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a reference on the module, if it is loading or running.
    pub fn acquire(&self) -> Option<ModuleRef> {
        let record = self.record.upgrade()?;
        if record.try_acquire() {
            Some(ModuleRef {
                record,
                registry: self.registry.clone(),
            })
        } else {
            None
        }
    }

    /// Record that a listener owned by this module is active. Holds do not
    /// block unloading; they show up in module listings, and any still present
    /// after the module's unload callback are reported as leaks.
    pub fn hold_listener(&self) -> ListenerHold {
        if let Some(record) = self.record.upgrade() {
            record.listener_holds.fetch_add(1, Ordering::SeqCst);
        }
        ListenerHold {
            record: self.record.clone(),
        }
    }

    /// The registry this module belongs to, if it is still alive.
    pub fn registry(&self) -> Option<ModuleRegistry> {
        self.registry.upgrade().map(ModuleRegistry::from_inner)
    }

    /// Whether the module this handle names has been discarded.
    pub fn is_gone(&self) -> bool {
        match self.record.upgrade() {
            Some(record) => record.state() == ModuleState::Unloaded,
            None => true,
        }
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleHandle").field(&self.name).finish()
    }
}

/// A counted reference to a running module.
///
/// While any `ModuleRef` exists the module can be neither unloaded nor
/// reloaded. Dropping the last one runs a deferred reload if one is pending.
pub struct ModuleRef {
    record: Arc<ModuleRecord>,
    registry: Weak<RegistryInner>,
}

impl ModuleRef {
    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn handle(&self) -> ModuleHandle {
        ModuleHandle::new(&self.record, self.registry.clone())
    }

    pub fn refcount(&self) -> usize {
        self.record.refcount()
    }

    /// Give up this reference. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Clone for ModuleRef {
    fn clone(&self) -> Self {
        // A live reference keeps the count above zero, so the teardown marker
        // cannot be set concurrently.
        self.record.refcount.fetch_add(1, Ordering::SeqCst);
        Self {
            record: Arc::clone(&self.record),
            registry: self.registry.clone(),
        }
    }
}

impl Drop for ModuleRef {
    fn drop(&mut self) {
        let remaining = self.record.release();
        if remaining == 0 && self.record.pending_reload() {
            if let Some(inner) = self.registry.upgrade() {
                ModuleRegistry::from_inner(inner).run_deferred_reload(&self.record);
            }
        }
    }
}

impl fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleRef").field(&self.record.name()).finish()
    }
}

/// An active listener registered on behalf of a module.
pub struct ListenerHold {
    record: Weak<ModuleRecord>,
}

impl Drop for ListenerHold {
    fn drop(&mut self) {
        if let Some(record) = self.record.upgrade() {
            record.listener_holds.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
