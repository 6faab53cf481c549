use crate::ModuleContext;

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Capability flags declared by a module.
    #[derive(Default)]
    pub struct ModuleFlags: u32 {
        /// The module exports symbols that other modules link against. Shared
        /// libraries carrying this flag are promoted to `RTLD_GLOBAL`.
        const GLOBAL_SYMBOLS = 1 << 0;
    }
}

/// Lifecycle state of a module record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ModuleState {
    Registered,
    Loading,
    Running,
    Unloading,
    Unloaded,
}

impl ModuleState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Registered,
            1 => Self::Loading,
            2 => Self::Running,
            3 => Self::Unloading,
            _ => Self::Unloaded,
        }
    }
}

/// The entry points of a loadable unit.
///
/// Callbacks run with the module's own lock held, so no load, reload or unload
/// of the same module can overlap them. They must not call back into the
/// registry to change the state of the module they belong to.
pub trait Module: Send + 'static {
    /// Name used to find the module; must match the name it was loaded under.
    fn name(&self) -> &str;

    /// Human-readable description, shown in module listings.
    fn description(&self) -> &str;

    fn flags(&self) -> ModuleFlags {
        ModuleFlags::empty()
    }

    /// Start the module: read configuration, register listeners, acquire
    /// dependencies. An error aborts the load and the module is discarded.
    fn load(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()>;

    /// Re-read configuration without restarting. Returning `None` means the
    /// module has no reload handler.
    fn reload(&mut self, _ctx: &ModuleContext<'_>) -> Option<anyhow::Result<()>> {
        None
    }

    /// Release everything the module holds, including its listeners and any
    /// module references acquired in `load`. Returning an error keeps the
    /// module running.
    fn unload(&mut self, ctx: &ModuleContext<'_>) -> anyhow::Result<()>;
}

/// Constructor for a fresh module instance.
pub type ModuleConstructor = fn() -> Box<dyn Module>;

/// A module compiled into the host binary, registered with [`builtin_module!`].
pub struct BuiltinModule {
    pub name: &'static str,
    pub create: ModuleConstructor,
}

impl BuiltinModule {
    pub const fn new(name: &'static str, create: ModuleConstructor) -> Self {
        Self { name, create }
    }
}

inventory::collect!(BuiltinModule);

/// ABI revision checked by [`DynamicLoader`](crate::DynamicLoader) before calling
/// into a shared library.
pub const MODULE_ABI_VERSION: u32 = 1;

/// Symbol exported by [`declare_module!`] holding the library's ABI revision.
pub const ABI_SYMBOL: &[u8] = b"portico_module_abi\0";

/// Symbol exported by [`declare_module!`] constructing the module instance.
pub const ENTRY_SYMBOL: &[u8] = b"portico_module_entry\0";

/// Register a module type compiled into the host.
///
/// ```ignore
/// builtin_module!("echo", EchoModule::default());
/// ```
#[macro_export]
macro_rules! builtin_module {
    ($name:literal, $ctor:expr) => {
        const _: () = {
            fn __portico_create() -> ::std::boxed::Box<dyn $crate::Module> {
                ::std::boxed::Box::new($ctor)
            }

            $crate::inventory::submit! {
                $crate::BuiltinModule::new($name, __portico_create)
            }
        };
    };
}

/// Export the entry points of a module built as a `cdylib`/`dylib`.
///
/// The library must be built with the same compiler and the same version of
/// this crate as the host, since the entry point returns a Rust trait object.
#[macro_export]
macro_rules! declare_module {
    ($ctor:expr) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static portico_module_abi: u32 = $crate::MODULE_ABI_VERSION;

        #[no_mangle]
        pub fn portico_module_entry() -> ::std::boxed::Box<dyn $crate::Module> {
            ::std::boxed::Box::new($ctor)
        }
    };
}
