use crate::*;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::{hash_map::Entry, HashMap},
    fmt,
    sync::Arc,
};

pub(crate) struct RegistryInner {
    modules: RwLock<HashMap<String, Arc<ModuleRecord>>>,
    // Names of running modules, in the order their loads completed.
    load_order: Mutex<Vec<String>>,
    loaders: Vec<Box<dyn ModuleLoader>>,
    config: Box<dyn ConfigProvider>,
    host: Option<Arc<dyn Any + Send + Sync>>,
}

/// The table of modules known to this process.
///
/// Cloning a `ModuleRegistry` produces another handle to the same table.
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

/// Result of a successful [`ModuleRegistry::reload`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The module was torn down and loaded again before the call returned.
    Reloaded,
    /// The module is referenced; it will be reloaded when the last reference
    /// is released.
    Deferred,
}

/// Which modules to start when the host comes up.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoadPlan {
    /// Loaded first, in order.
    pub preload: Vec<String>,
    /// Loaded after the preload list, in order.
    pub autoload: Vec<String>,
    /// Also load every other module the loaders can find.
    pub autoload_all: bool,
    /// Never loaded by `autoload_all`.
    pub noload: Vec<String>,
}

/// A point-in-time view of one module, for listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub name: String,
    pub description: String,
    #[serde(skip)]
    pub flags: ModuleFlags,
    pub state: ModuleState,
    pub refcount: usize,
    pub pending_reload: bool,
    pub listeners: usize,
    pub dependencies: Vec<String>,
}

impl ModuleSummary {
    pub fn status(&self) -> ModuleStatus {
        match self.state {
            ModuleState::Running if self.pending_reload => ModuleStatus::PendingReload,
            ModuleState::Running if self.refcount > 0 => ModuleStatus::InUse(self.refcount),
            state => ModuleStatus::State(state),
        }
    }
}

/// How a module listing describes a module's condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStatus {
    State(ModuleState),
    InUse(usize),
    PendingReload,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(state) => write!(f, "{}", state),
            Self::InUse(refs) => write!(f, "in use ({} refs)", refs),
            Self::PendingReload => f.write_str("pending reload"),
        }
    }
}

/// Configures and creates a [`ModuleRegistry`].
pub struct ModuleRegistryBuilder {
    loaders: Vec<Box<dyn ModuleLoader>>,
    config: Box<dyn ConfigProvider>,
    host: Option<Arc<dyn Any + Send + Sync>>,
}

impl ModuleRegistryBuilder {
    /// Add a loader. Loaders are consulted in the order they were added.
    pub fn loader(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }

    pub fn config_provider(mut self, config: impl ConfigProvider + 'static) -> Self {
        self.config = Box::new(config);
        self
    }

    /// Shared services made available to modules through [`ModuleContext::host`].
    pub fn host<T: Any + Send + Sync>(mut self, host: Arc<T>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> ModuleRegistry {
        ModuleRegistry {
            inner: Arc::new(RegistryInner {
                modules: RwLock::new(HashMap::new()),
                load_order: Mutex::new(Vec::new()),
                loaders: self.loaders,
                config: self.config,
                host: self.host,
            }),
        }
    }
}

type ImageSlot = Option<ModuleImage>;

impl ModuleRegistry {
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder {
            loaders: Vec::new(),
            config: Box::new(NoModuleConfig),
            host: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn host(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.inner.host.as_deref()
    }

    fn record(&self, name: &str) -> Option<Arc<ModuleRecord>> {
        self.inner.modules.read().get(name).cloned()
    }

    pub(crate) fn handle_for(&self, record: &Arc<ModuleRecord>) -> ModuleHandle {
        ModuleHandle::new(record, Arc::downgrade(&self.inner))
    }

    /// A handle on the named module, if it is registered.
    pub fn handle(&self, name: &str) -> Option<ModuleHandle> {
        let name = normalize_module_name(name);
        self.record(name).map(|record| self.handle_for(&record))
    }

    pub fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.record(normalize_module_name(name))
            .map(|record| record.state())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state_of(name) == Some(ModuleState::Running)
    }

    /// Every module name the configured loaders could open.
    pub fn available_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .loaders
            .iter()
            .flat_map(|loader| loader.available())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Add an already-opened module to the table without starting it.
    pub fn register(&self, image: ModuleImage) -> Result<ModuleHandle, ModuleError> {
        let record = Arc::new(ModuleRecord::new(image));
        self.insert(&record)?;
        tracing::debug!(module = %record.name(), "registered module");
        Ok(self.handle_for(&record))
    }

    fn insert(&self, record: &Arc<ModuleRecord>) -> Result<(), ModuleError> {
        match self.inner.modules.write().entry(record.name().to_string()) {
            Entry::Occupied(_) => Err(ModuleError::NameConflict(record.name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(record));
                Ok(())
            }
        }
    }

    fn remove(&self, record: &Arc<ModuleRecord>) {
        {
            let mut modules = self.inner.modules.write();
            if modules
                .get(record.name())
                .map_or(false, |current| Arc::ptr_eq(current, record))
            {
                modules.remove(record.name());
            }
        }
        self.inner
            .load_order
            .lock()
            .retain(|name| name != record.name());
    }

    /// Remove a module that was registered but never started.
    pub fn unregister(&self, name: &str) -> Result<(), ModuleError> {
        let name = normalize_module_name(name);
        let record = self
            .record(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        let mut slot = record.image.lock();
        match record.state() {
            ModuleState::Registered => (),
            state => {
                return Err(ModuleError::Busy {
                    name: name.to_string(),
                    state,
                })
            }
        }
        let image = self.discard(&record, &mut slot);
        drop(slot);
        drop(image);

        tracing::debug!(module = %name, "unregistered module");
        Ok(())
    }

    // Take the module out of the table. The caller drops the returned image
    // after releasing the module lock.
    fn discard(&self, record: &Arc<ModuleRecord>, slot: &mut ImageSlot) -> ImageSlot {
        record.set_state(ModuleState::Unloaded);
        record.set_pending_reload(false);
        record.take_dependencies();
        self.remove(record);
        slot.take()
    }

    fn open_image(&self, name: &str) -> Result<ModuleImage, ModuleError> {
        for loader in &self.inner.loaders {
            if let Some(image) = loader.open(name)? {
                if image.module().name() != name {
                    return Err(ModuleError::Image {
                        name: name.to_string(),
                        message: format!("unit calls itself {}", image.module().name()),
                    });
                }
                return Ok(image);
            }
        }
        Err(ModuleError::NotFound(name.to_string()))
    }

    /// Load and start the named module.
    ///
    /// A module already registered is started in place; otherwise each loader
    /// is asked for it in turn.
    pub fn load(&self, name: &str) -> Result<(), ModuleError> {
        let name = normalize_module_name(name);

        if let Some(record) = self.record(name) {
            let mut slot = record.image.lock();
            return match record.state() {
                ModuleState::Registered => self.start(&record, &mut slot),
                ModuleState::Running => Err(ModuleError::AlreadyLoaded(name.to_string())),
                state => Err(ModuleError::Busy {
                    name: name.to_string(),
                    state,
                }),
            };
        }

        let record = Arc::new(ModuleRecord::new(self.open_image(name)?));
        // Hold the new record's lock across publication so nobody else can
        // start it first.
        let mut slot = record.image.lock();
        if let Err(e) = self.insert(&record) {
            let image = slot.take();
            drop(slot);
            drop(image);
            return Err(match e {
                ModuleError::NameConflict(name) => ModuleError::AlreadyLoaded(name),
                e => e,
            });
        }

        self.start(&record, &mut slot)
    }

    // Run the load callback. On failure the module is discarded once any
    // references taken during the callback have been released.
    //
    // Entered with the teardown marker set. References are accepted from here
    // on, so work the module starts during load can already use its handle.
    fn start(&self, record: &Arc<ModuleRecord>, slot: &mut ImageSlot) -> Result<(), ModuleError> {
        let name = record.name().to_string();
        record.set_state(ModuleState::Loading);
        record.end_teardown();

        let result = match self.inner.config.module_config(&name) {
            Ok(config) => {
                let ctx = ModuleContext::new(self, record, config);
                match slot.as_mut() {
                    Some(image) => image
                        .module_mut()
                        .load(&ctx)
                        .map_err(|source| ModuleError::LoadFailed {
                            name: name.clone(),
                            source,
                        }),
                    None => Err(ModuleError::NotFound(name.clone())),
                }
            }
            Err(e) => Err(ModuleError::Config {
                name: name.clone(),
                message: format!("{:#}", e),
            }),
        };

        match result {
            Ok(()) => {
                record.set_state(ModuleState::Running);
                self.inner.load_order.lock().push(name.clone());
                tracing::info!(module = %name, "loaded module");
                Ok(())
            }
            Err(e) => {
                tracing::error!(module = %name, "failed to load module: {}", e);
                let leftover = record.dependencies();
                if !leftover.is_empty() {
                    tracing::warn!(module = %name, ?leftover, "failed load left dependency records behind");
                }
                record.drain_references();
                let _image = self.discard(record, slot);
                Err(e)
            }
        }
    }

    // Run the unload callback and take the image out of the slot. If the
    // module refuses, it goes back to running and accepting references.
    fn stop(&self, record: &Arc<ModuleRecord>, slot: &mut ImageSlot) -> Result<ModuleImage, ModuleError> {
        let name = record.name().to_string();
        record.set_state(ModuleState::Unloading);

        let ctx = ModuleContext::new(self, record, None);
        let result = match slot.as_mut() {
            Some(image) => image.module_mut().unload(&ctx),
            None => Ok(()),
        };

        if let Err(source) = result {
            record.set_state(ModuleState::Running);
            record.end_teardown();
            tracing::warn!(module = %name, "module refused to unload: {:#}", source);
            return Err(ModuleError::UnloadRefused { name, source });
        }

        let leftover = record.take_dependencies();
        if !leftover.is_empty() {
            tracing::warn!(module = %name, ?leftover, "module did not release its dependencies before unloading");
        }
        let listeners = record.listener_holds();
        if listeners > 0 {
            tracing::error!(module = %name, listeners, "module left listeners running after unload");
        }

        slot.take().ok_or(ModuleError::NotRunning(name))
    }

    /// Stop and discard the named module.
    ///
    /// Refused with [`ModuleError::InUse`] while any reference to the module
    /// is live.
    pub fn unload(&self, name: &str) -> Result<(), ModuleError> {
        let name = normalize_module_name(name);
        let record = self
            .record(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        let mut slot = record.image.lock();
        match record.state() {
            ModuleState::Running => (),
            ModuleState::Registered => {
                let image = self.discard(&record, &mut slot);
                drop(slot);
                drop(image);
                tracing::debug!(module = %name, "discarded module that was never started");
                return Ok(());
            }
            state => {
                return Err(ModuleError::Busy {
                    name: name.to_string(),
                    state,
                })
            }
        }

        if !record.begin_teardown() {
            return Err(ModuleError::InUse {
                name: name.to_string(),
                refcount: record.refcount(),
            });
        }

        let image = self.stop(&record, &mut slot)?;
        let _ = self.discard(&record, &mut slot);
        drop(slot);
        drop(image);

        tracing::info!(module = %name, "unloaded module");
        Ok(())
    }

    /// Replace the named module with a fresh instance from the same source.
    ///
    /// If the module is referenced, a reload with `try_delayed` set is queued
    /// to run when the last reference is released and
    /// [`ReloadOutcome::Deferred`] is returned; without it the reload is
    /// refused with [`ModuleError::InUse`]. If the fresh instance fails to
    /// load, the module ends up unloaded.
    pub fn reload(&self, name: &str, try_delayed: bool) -> Result<ReloadOutcome, ModuleError> {
        let name = normalize_module_name(name);
        let record = self
            .record(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        let mut slot = record.image.lock();
        if record.state() != ModuleState::Running {
            return Err(ModuleError::NotRunning(name.to_string()));
        }

        // The flag goes up before the count is sampled, so a release racing
        // with this call either sees it or leaves the count at zero for us.
        if try_delayed {
            record.set_pending_reload(true);
        }

        if !record.begin_teardown() {
            if try_delayed {
                tracing::info!(module = %name, refcount = record.refcount(), "module in use, reload deferred");
                return Ok(ReloadOutcome::Deferred);
            }
            return Err(ModuleError::InUse {
                name: name.to_string(),
                refcount: record.refcount(),
            });
        }
        record.set_pending_reload(false);

        self.restart(&record, &mut slot)?;
        Ok(ReloadOutcome::Reloaded)
    }

    // Called by the release of a module's last reference.
    pub(crate) fn run_deferred_reload(&self, record: &Arc<ModuleRecord>) {
        let mut slot = record.image.lock();
        if !record.pending_reload() || record.state() != ModuleState::Running {
            return;
        }
        // Someone took a new reference since the count hit zero; the last of
        // those will get here again.
        if !record.begin_teardown() {
            return;
        }
        record.set_pending_reload(false);

        tracing::info!(module = %record.name(), "running deferred reload");
        if let Err(e) = self.restart(record, &mut slot) {
            tracing::error!(module = %record.name(), "deferred reload failed: {}", e);
        }
    }

    // With the teardown marker set: unload, release the old code, then open
    // and start a fresh image.
    fn restart(&self, record: &Arc<ModuleRecord>, slot: &mut ImageSlot) -> Result<(), ModuleError> {
        let old = self.stop(record, slot)?;
        let source = old.source().clone();
        // The old library has to be closed before reopening, or the loader
        // hands back the same mapping.
        drop(old);

        match source.open() {
            Ok(image) if image.module().name() == record.name() => {
                record.refresh_meta(&image);
                *slot = Some(image);
            }
            Ok(image) => {
                let message = format!("unit now calls itself {}", image.module().name());
                drop(image);
                let _ = self.discard(record, slot);
                return Err(ModuleError::Image {
                    name: record.name().to_string(),
                    message,
                });
            }
            Err(e) => {
                let _ = self.discard(record, slot);
                return Err(e);
            }
        }

        self.inner.load_order.lock().retain(|n| n != record.name());
        self.start(record, slot)?;
        tracing::info!(module = %record.name(), "reloaded module");
        Ok(())
    }

    /// Ask a running module to re-read its configuration without restarting.
    pub fn reconfigure(&self, name: &str) -> Result<(), ModuleError> {
        let name = normalize_module_name(name);
        let record = self
            .record(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        let mut slot = record.image.lock();
        if record.state() != ModuleState::Running {
            return Err(ModuleError::NotRunning(name.to_string()));
        }

        let config = self
            .inner
            .config
            .module_config(name)
            .map_err(|e| ModuleError::Config {
                name: name.to_string(),
                message: format!("{:#}", e),
            })?;
        let ctx = ModuleContext::new(self, &record, config);

        let image = slot
            .as_mut()
            .ok_or_else(|| ModuleError::NotRunning(name.to_string()))?;
        match image.module_mut().reload(&ctx) {
            None => Err(ModuleError::NoReloadHandler(name.to_string())),
            Some(Err(source)) => Err(ModuleError::ReconfigureFailed {
                name: name.to_string(),
                source,
            }),
            Some(Ok(())) => {
                tracing::info!(module = %name, "reconfigured module");
                Ok(())
            }
        }
    }

    /// Snapshot of every module in the table, sorted by name.
    pub fn list_modules(&self) -> Vec<ModuleSummary> {
        let records: Vec<_> = self.inner.modules.read().values().cloned().collect();

        let mut summaries: Vec<_> = records
            .iter()
            .map(|record| ModuleSummary {
                name: record.name().to_string(),
                description: record.description(),
                flags: record.flags(),
                state: record.state(),
                refcount: record.refcount(),
                pending_reload: record.pending_reload(),
                listeners: record.listener_holds(),
                dependencies: record.dependencies(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Start the modules named by `plan`. Failures are logged and skipped;
    /// returns the number of modules started.
    pub fn load_modules(&self, plan: &LoadPlan) -> usize {
        let mut names: Vec<String> = plan.preload.iter().chain(&plan.autoload).cloned().collect();
        if plan.autoload_all {
            names.extend(
                self.available_modules()
                    .into_iter()
                    .filter(|name| !plan.noload.iter().any(|n| normalize_module_name(n) == name)),
            );
        }

        let mut started = 0;
        for name in names {
            if self.is_running(&name) {
                continue;
            }
            match self.load(&name) {
                Ok(()) => started += 1,
                Err(ModuleError::AlreadyLoaded(_)) => (),
                Err(e) => tracing::error!(module = %name, "autoload failed: {}", e),
            }
        }
        tracing::info!(started, "module autoload complete");
        started
    }

    /// Unload every module, most recently loaded first, retrying while that
    /// makes progress. Returns the names of modules that could not be unloaded.
    pub fn unload_all(&self) -> Vec<String> {
        loop {
            let order: Vec<String> = self.inner.load_order.lock().iter().rev().cloned().collect();
            let mut progress = false;

            for name in order {
                match self.unload(&name) {
                    Ok(()) => progress = true,
                    Err(e) if e.is_in_use() => (),
                    Err(e) => tracing::warn!(module = %name, "unload during shutdown failed: {}", e),
                }
            }

            if !progress {
                break;
            }
        }

        let never_started: Vec<String> = self
            .list_modules()
            .into_iter()
            .filter(|summary| summary.state == ModuleState::Registered)
            .map(|summary| summary.name)
            .collect();
        for name in never_started {
            if let Err(e) = self.unregister(&name) {
                tracing::warn!(module = %name, "could not unregister module: {}", e);
            }
        }

        let remaining: Vec<String> = self.list_modules().into_iter().map(|s| s.name).collect();
        for name in &remaining {
            tracing::warn!(module = %name, "module still loaded at shutdown");
        }
        remaining
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.inner.modules.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        loads: AtomicUsize,
        unloads: AtomicUsize,
        reconfigures: AtomicUsize,
        fail_next_load: AtomicBool,
        refuse_unload: AtomicBool,
        last_config: Mutex<Option<serde_json::Value>>,
    }

    impl Counters {
        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
        fn unloads(&self) -> usize {
            self.unloads.load(Ordering::SeqCst)
        }
    }

    struct TestModule {
        name: &'static str,
        counters: Arc<Counters>,
        requires: Vec<&'static str>,
        held: Vec<ModuleRef>,
    }

    impl Module for TestModule {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test module"
        }

        fn load(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
            if self.counters.fail_next_load.swap(false, Ordering::SeqCst) {
                anyhow::bail!("asked to fail");
            }
            for dep in &self.requires {
                self.held.push(ctx.require_module(dep)?);
            }
            *self.counters.last_config.lock() = ctx.config().cloned();
            self.counters.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn reload(&mut self, ctx: &ModuleContext<'_>) -> Option<anyhow::Result<()>> {
            *self.counters.last_config.lock() = ctx.config().cloned();
            self.counters.reconfigures.fetch_add(1, Ordering::SeqCst);
            Some(Ok(()))
        }

        fn unload(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
            if self.counters.refuse_unload.load(Ordering::SeqCst) {
                anyhow::bail!("not now");
            }
            while let Some(dep) = self.held.pop() {
                ctx.unrequire_module(dep);
            }
            self.counters.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        registry: ModuleRegistry,
        counters: HashMap<&'static str, Arc<Counters>>,
    }

    impl Fixture {
        fn new(units: &[(&'static str, &[&'static str])]) -> Self {
            Self::with_config(units, HashMap::new())
        }

        fn with_config(
            units: &[(&'static str, &[&'static str])],
            config: HashMap<String, serde_json::Value>,
        ) -> Self {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();

            let mut loader = StaticLoader::empty();
            let mut counters = HashMap::new();

            for &(name, requires) in units {
                let unit_counters = Arc::new(Counters::default());
                counters.insert(name, Arc::clone(&unit_counters));
                let requires = requires.to_vec();
                loader = loader.with_factory(name, move || {
                    Box::new(TestModule {
                        name,
                        counters: Arc::clone(&unit_counters),
                        requires: requires.clone(),
                        held: Vec::new(),
                    })
                });
            }

            let registry = ModuleRegistry::builder()
                .loader(loader)
                .config_provider(config)
                .build();
            Self { registry, counters }
        }

        fn counters(&self, name: &str) -> &Counters {
            &self.counters[name]
        }

        fn acquire(&self, name: &str) -> ModuleRef {
            self.registry.handle(name).unwrap().acquire().unwrap()
        }
    }

    #[test]
    fn load_then_unload() {
        let f = Fixture::new(&[("alpha", &[])]);

        f.registry.load("alpha.so").unwrap();
        assert_eq!(f.registry.state_of("alpha"), Some(ModuleState::Running));
        assert_eq!(f.counters("alpha").loads(), 1);

        let listing = f.registry.list_modules();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "alpha");
        assert_eq!(listing[0].refcount, 0);
        assert_eq!(listing[0].status().to_string(), "running");

        f.registry.unload("alpha").unwrap();
        assert_eq!(f.counters("alpha").unloads(), 1);
        assert_eq!(f.registry.state_of("alpha"), None);
        assert!(f.registry.list_modules().is_empty());
    }

    #[test]
    fn unknown_module_is_not_found() {
        let f = Fixture::new(&[]);
        assert!(matches!(f.registry.load("nope"), Err(ModuleError::NotFound(_))));
        assert!(matches!(f.registry.unload("nope"), Err(ModuleError::NotFound(_))));
        assert!(matches!(
            f.registry.reload("nope", true),
            Err(ModuleError::NotFound(_))
        ));
    }

    #[test]
    fn names_are_unique() {
        let f = Fixture::new(&[("alpha", &[])]);
        let counters = Arc::new(Counters::default());
        let make = move || {
            Box::new(TestModule {
                name: "beta",
                counters: Arc::clone(&counters),
                requires: Vec::new(),
                held: Vec::new(),
            }) as Box<dyn Module>
        };

        f.registry.register(ModuleImage::from_factory(make.clone())).unwrap();
        assert!(matches!(
            f.registry.register(ModuleImage::from_factory(make)),
            Err(ModuleError::NameConflict(_))
        ));
        assert_eq!(f.registry.state_of("beta"), Some(ModuleState::Registered));

        f.registry.load("alpha").unwrap();
        assert!(matches!(
            f.registry.load("alpha"),
            Err(ModuleError::AlreadyLoaded(_))
        ));
        assert_eq!(f.counters("alpha").loads(), 1);
    }

    #[test]
    fn registered_module_starts_in_place() {
        let f = Fixture::new(&[]);
        let counters = Arc::new(Counters::default());
        let c = Arc::clone(&counters);
        let handle = f
            .registry
            .register(ModuleImage::from_factory(move || {
                Box::new(TestModule {
                    name: "gamma",
                    counters: Arc::clone(&c),
                    requires: Vec::new(),
                    held: Vec::new(),
                })
            }))
            .unwrap();

        assert!(handle.acquire().is_none());
        f.registry.load("gamma").unwrap();
        assert_eq!(counters.loads(), 1);
        assert!(handle.acquire().is_some());

        f.registry.unload("gamma").unwrap();
        assert!(handle.is_gone());
    }

    #[test]
    fn unregister_only_before_start() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.registry.load("alpha").unwrap();
        assert!(matches!(
            f.registry.unregister("alpha"),
            Err(ModuleError::Busy {
                state: ModuleState::Running,
                ..
            })
        ));
    }

    #[test]
    fn failed_load_discards_module() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.counters("alpha").fail_next_load.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.registry.load("alpha"),
            Err(ModuleError::LoadFailed { .. })
        ));
        assert_eq!(f.registry.state_of("alpha"), None);

        f.registry.load("alpha").unwrap();
        assert_eq!(f.counters("alpha").loads(), 1);
    }

    #[test]
    fn refcount_tracks_references() {
        let f = Fixture::new(&[("alpha", &[])]);
        let handle = {
            f.registry.load("alpha").unwrap();
            f.registry.handle("alpha").unwrap()
        };

        let first = handle.acquire().unwrap();
        let second = first.clone();
        assert_eq!(first.refcount(), 2);
        drop(first);
        assert_eq!(second.refcount(), 1);
        second.release();
        assert_eq!(f.registry.list_modules()[0].refcount, 0);

        f.registry.unload("alpha").unwrap();
        assert!(handle.acquire().is_none());
    }

    #[test]
    fn unload_refused_while_referenced() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.registry.load("alpha").unwrap();

        let held = f.acquire("alpha");
        match f.registry.unload("alpha") {
            Err(ModuleError::InUse { refcount, .. }) => assert_eq!(refcount, 1),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(f.registry.reload("alpha", false).unwrap_err().is_in_use());
        assert_eq!(f.counters("alpha").unloads(), 0);

        drop(held);
        f.registry.unload("alpha").unwrap();
        assert_eq!(f.counters("alpha").unloads(), 1);
    }

    #[test]
    fn immediate_reload_replaces_instance() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.registry.load("alpha").unwrap();

        assert_eq!(
            f.registry.reload("alpha", false).unwrap(),
            ReloadOutcome::Reloaded
        );
        assert_eq!(f.counters("alpha").loads(), 2);
        assert_eq!(f.counters("alpha").unloads(), 1);
        assert_eq!(f.registry.state_of("alpha"), Some(ModuleState::Running));
    }

    #[test]
    fn deferred_reload_runs_once_on_last_release() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.registry.load("alpha").unwrap();

        let a = f.acquire("alpha");
        let b = f.acquire("alpha");
        assert_eq!(
            f.registry.reload("alpha", true).unwrap(),
            ReloadOutcome::Deferred
        );
        assert_eq!(
            f.registry.list_modules()[0].status(),
            ModuleStatus::PendingReload
        );

        drop(a);
        assert_eq!(f.counters("alpha").loads(), 1);

        drop(b);
        assert_eq!(f.counters("alpha").loads(), 2);
        assert_eq!(f.counters("alpha").unloads(), 1);

        let summary = &f.registry.list_modules()[0];
        assert!(!summary.pending_reload);
        assert_eq!(summary.state, ModuleState::Running);

        f.acquire("alpha").release();
        assert_eq!(f.counters("alpha").loads(), 2);
    }

    #[test]
    fn deferred_reload_under_contention() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.registry.load("alpha").unwrap();
        let handle = f.registry.handle("alpha").unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        // Acquisition fails while the reload is in progress.
                        if let Some(r) = handle.acquire() {
                            let again = r.clone();
                            drop(r);
                            drop(again);
                        }
                    }
                })
            })
            .collect();

        f.registry.reload("alpha", true).unwrap();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(f.counters("alpha").loads(), 2);
        assert_eq!(f.counters("alpha").unloads(), 1);
        let summary = &f.registry.list_modules()[0];
        assert!(!summary.pending_reload);
        assert_eq!(summary.refcount, 0);
    }

    #[test]
    fn dependencies_hold_their_target() {
        let f = Fixture::new(&[("base", &[]), ("app", &["base"])]);

        f.registry.load("app").unwrap();
        assert!(f.registry.is_running("base"));

        let listing = f.registry.list_modules();
        let app = listing.iter().find(|m| m.name == "app").unwrap();
        let base = listing.iter().find(|m| m.name == "base").unwrap();
        assert_eq!(app.dependencies, vec!["base".to_string()]);
        assert_eq!(base.refcount, 1);

        assert!(f.registry.unload("base").unwrap_err().is_in_use());

        f.registry.unload("app").unwrap();
        assert_eq!(f.registry.list_modules()[0].refcount, 0);
        f.registry.unload("base").unwrap();
    }

    #[test]
    fn unload_all_goes_in_reverse_order() {
        let f = Fixture::new(&[("base", &[]), ("app", &["base"]), ("other", &[])]);
        f.registry.load("app").unwrap();
        f.registry.load("other").unwrap();

        assert!(f.registry.unload_all().is_empty());
        for name in ["base", "app", "other"] {
            assert_eq!(f.counters(name).unloads(), 1);
        }
    }

    #[test]
    fn unload_all_reports_stragglers() {
        let f = Fixture::new(&[("alpha", &[]), ("beta", &[])]);
        f.registry.load("alpha").unwrap();
        f.registry.load("beta").unwrap();

        let held = f.acquire("beta");
        assert_eq!(f.registry.unload_all(), vec!["beta".to_string()]);
        drop(held);
        assert!(f.registry.unload_all().is_empty());
    }

    #[test]
    fn refused_unload_keeps_module_running() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.registry.load("alpha").unwrap();
        f.counters("alpha").refuse_unload.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.registry.unload("alpha"),
            Err(ModuleError::UnloadRefused { .. })
        ));
        assert_eq!(f.registry.state_of("alpha"), Some(ModuleState::Running));
        f.acquire("alpha").release();

        f.counters("alpha").refuse_unload.store(false, Ordering::SeqCst);
        f.registry.unload("alpha").unwrap();
    }

    #[test]
    fn failed_reload_leaves_module_unloaded() {
        let f = Fixture::new(&[("alpha", &[])]);
        f.registry.load("alpha").unwrap();
        f.counters("alpha").fail_next_load.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.registry.reload("alpha", false),
            Err(ModuleError::LoadFailed { .. })
        ));
        assert_eq!(f.registry.state_of("alpha"), None);
    }

    #[test]
    fn configuration_reaches_the_module() {
        let mut config = HashMap::new();
        config.insert("alpha".to_string(), json!({ "port": 2525 }));
        let f = Fixture::with_config(&[("alpha", &[])], config);

        f.registry.load("alpha").unwrap();
        assert_eq!(
            *f.counters("alpha").last_config.lock(),
            Some(json!({ "port": 2525 }))
        );

        f.registry.reconfigure("alpha").unwrap();
        assert_eq!(f.counters("alpha").reconfigures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broken_configuration_fails_the_load() {
        struct Broken;
        impl ConfigProvider for Broken {
            fn module_config(&self, _name: &str) -> anyhow::Result<Option<serde_json::Value>> {
                anyhow::bail!("settings file is unreadable")
            }
        }

        let counters = Arc::new(Counters::default());
        let registry = ModuleRegistry::builder()
            .loader(StaticLoader::empty().with_factory("alpha", move || {
                Box::new(TestModule {
                    name: "alpha",
                    counters: Arc::clone(&counters),
                    requires: Vec::new(),
                    held: Vec::new(),
                })
            }))
            .config_provider(Broken)
            .build();

        assert!(matches!(
            registry.load("alpha"),
            Err(ModuleError::Config { .. })
        ));
        assert_eq!(registry.state_of("alpha"), None);
    }

    #[test]
    fn load_plan_order_and_exclusions() {
        let f = Fixture::new(&[("alpha", &[]), ("beta", &[]), ("gamma", &[])]);
        let plan = LoadPlan {
            preload: vec!["beta".into()],
            autoload: vec!["beta.so".into()],
            autoload_all: true,
            noload: vec!["gamma.so".into()],
        };

        assert_eq!(f.registry.load_modules(&plan), 2);
        assert!(f.registry.is_running("alpha"));
        assert!(f.registry.is_running("beta"));
        assert_eq!(f.registry.state_of("gamma"), None);
    }

    #[test]
    fn host_services_are_visible_to_modules() {
        struct Services {
            greeting: &'static str,
        }

        struct Greeter(Arc<Mutex<Option<String>>>);
        impl Module for Greeter {
            fn name(&self) -> &str {
                "greeter"
            }
            fn description(&self) -> &str {
                "reads host services"
            }
            fn load(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
                let services = ctx
                    .host::<Services>()
                    .ok_or_else(|| anyhow::anyhow!("no host services"))?;
                *self.0.lock() = Some(services.greeting.to_string());
                Ok(())
            }
            fn unload(&mut self, _ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let registry = ModuleRegistry::builder()
            .loader(StaticLoader::empty().with_factory("greeter", move || {
                Box::new(Greeter(Arc::clone(&s)))
            }))
            .host(Arc::new(Services { greeting: "hello" }))
            .build();

        registry.load("greeter").unwrap();
        assert_eq!(seen.lock().as_deref(), Some("hello"));
    }

    // Hands its own handle to a worker thread during load, the way a module's
    // listener hands it to connection threads.
    struct Spawner {
        fail: bool,
        acquired: Arc<AtomicBool>,
        released: Arc<AtomicBool>,
    }

    impl Module for Spawner {
        fn name(&self) -> &str {
            "spawner"
        }
        fn description(&self) -> &str {
            "uses its handle from another thread while loading"
        }
        fn load(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
            let handle = ctx.handle();
            let acquired = Arc::clone(&self.acquired);
            let released = Arc::clone(&self.released);
            let hold = self.fail;
            let (tx, rx) = std::sync::mpsc::channel();

            std::thread::spawn(move || {
                let module_ref = handle.acquire();
                acquired.store(module_ref.is_some(), Ordering::SeqCst);
                let _ = tx.send(());
                if hold {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                released.store(true, Ordering::SeqCst);
                drop(module_ref);
            });

            rx.recv()?;
            if self.fail {
                anyhow::bail!("giving up after starting work");
            }
            Ok(())
        }
        fn unload(&mut self, _ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn spawner_registry(fail: bool) -> (ModuleRegistry, Arc<AtomicBool>, Arc<AtomicBool>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let acquired = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        let (a, r) = (Arc::clone(&acquired), Arc::clone(&released));
        let registry = ModuleRegistry::builder()
            .loader(StaticLoader::empty().with_factory("spawner", move || {
                Box::new(Spawner {
                    fail,
                    acquired: Arc::clone(&a),
                    released: Arc::clone(&r),
                })
            }))
            .build();
        (registry, acquired, released)
    }

    #[test]
    fn handle_is_usable_while_loading() {
        let (registry, acquired, _) = spawner_registry(false);

        registry.load("spawner").unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(registry.state_of("spawner"), Some(ModuleState::Running));

        let handle = registry.handle("spawner").unwrap();
        assert!(handle.acquire().is_some());
        registry.unload("spawner").unwrap();
        assert!(handle.acquire().is_none());
    }

    #[test]
    fn failed_load_waits_for_references_taken_during_load() {
        let (registry, acquired, released) = spawner_registry(true);

        assert!(matches!(
            registry.load("spawner"),
            Err(ModuleError::LoadFailed { .. })
        ));
        assert!(acquired.load(Ordering::SeqCst));
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(registry.state_of("spawner"), None);
    }
}
