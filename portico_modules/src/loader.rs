use crate::*;

use libloading::{os::unix::Library as UnixLibrary, Library, Symbol};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Constructor closure for modules registered at run time.
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

type ModuleEntry = fn() -> Box<dyn Module>;

/// Where a module's code comes from, and so how to bring it back after it has
/// been released.
#[derive(Clone)]
pub enum ImageSource {
    Builtin(ModuleConstructor),
    Factory(ModuleFactory),
    Library(PathBuf),
}

impl ImageSource {
    /// Bring the code into memory and construct a fresh module instance.
    pub fn open(&self) -> Result<ModuleImage, ModuleError> {
        match self {
            Self::Builtin(create) => Ok(ModuleImage::resident(create(), self.clone())),
            Self::Factory(create) => Ok(ModuleImage::resident(create(), self.clone())),
            Self::Library(path) => open_library(path),
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(_) => f.write_str("Builtin"),
            Self::Factory(_) => f.write_str("Factory"),
            Self::Library(path) => f.debug_tuple("Library").field(path).finish(),
        }
    }
}

/// A module instance together with the code backing it.
pub struct ModuleImage {
    // Field order is drop order: the instance has to go before the library
    // that contains its code.
    module: Box<dyn Module>,
    #[allow(dead_code)]
    promoted: Option<UnixLibrary>,
    library: Option<Library>,
    source: ImageSource,
}

impl ModuleImage {
    fn resident(module: Box<dyn Module>, source: ImageSource) -> Self {
        Self {
            module,
            promoted: None,
            library: None,
            source,
        }
    }

    /// Wrap a module type constructed by a closure, for hosts that create
    /// modules themselves rather than through a loader.
    pub fn from_factory(factory: impl Fn() -> Box<dyn Module> + Send + Sync + 'static) -> Self {
        let factory: ModuleFactory = Arc::new(factory);
        let module = factory();
        Self::resident(module, ImageSource::Factory(factory))
    }

    pub fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    pub fn module_mut(&mut self) -> &mut dyn Module {
        self.module.as_mut()
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn is_shared_library(&self) -> bool {
        self.library.is_some()
    }
}

fn open_library(path: &Path) -> Result<ModuleImage, ModuleError> {
    let image_error = |message: String| ModuleError::Image {
        name: path.display().to_string(),
        message,
    };

    let library = unsafe { Library::new(path) }.map_err(|e| image_error(e.to_string()))?;

    let abi = unsafe {
        let symbol: Symbol<*const u32> = library
            .get(ABI_SYMBOL)
            .map_err(|e| image_error(e.to_string()))?;
        **symbol
    };
    if abi != MODULE_ABI_VERSION {
        return Err(ModuleError::AbiMismatch {
            path: path.display().to_string(),
            expected: MODULE_ABI_VERSION,
            actual: abi,
        });
    }

    let module = unsafe {
        let entry: Symbol<ModuleEntry> = library
            .get(ENTRY_SYMBOL)
            .map_err(|e| image_error(e.to_string()))?;
        entry()
    };

    // The library was opened with local symbol scope. Modules that export
    // symbols for others get a second handle promoting it to global scope.
    let promoted = if module.flags().contains(ModuleFlags::GLOBAL_SYMBOLS) {
        let flags = libc::RTLD_NOW | libc::RTLD_GLOBAL | libc::RTLD_NOLOAD;
        match unsafe { UnixLibrary::open(Some(path), flags) } {
            Ok(lib) => Some(lib),
            Err(e) => {
                drop(module);
                return Err(image_error(format!("could not promote to global scope: {}", e)));
            }
        }
    } else {
        None
    };

    tracing::debug!(path = %path.display(), module = module.name(), "opened shared library");

    Ok(ModuleImage {
        module,
        promoted,
        library: Some(library),
        source: ImageSource::Library(path.to_path_buf()),
    })
}

/// Strip a trailing `.so`, so that `net_irc` and `net_irc.so` name the same module.
pub fn normalize_module_name(name: &str) -> &str {
    name.strip_suffix(".so").unwrap_or(name)
}

/// Locates module code by name.
pub trait ModuleLoader: Send + Sync {
    /// Open the named module, or `Ok(None)` if this loader doesn't know it.
    fn open(&self, name: &str) -> Result<Option<ModuleImage>, ModuleError>;

    /// Names of every module this loader could open.
    fn available(&self) -> Vec<String>;
}

/// Loads modules compiled into the host.
///
/// [`StaticLoader::new`] picks up every unit registered with
/// [`builtin_module!`](crate::builtin_module); further units can be added by name.
#[derive(Default)]
pub struct StaticLoader {
    modules: HashMap<String, ImageSource>,
}

impl StaticLoader {
    pub fn new() -> Self {
        let mut modules = HashMap::new();
        for builtin in inventory::iter::<BuiltinModule> {
            modules.insert(builtin.name.to_string(), ImageSource::Builtin(builtin.create));
        }
        Self { modules }
    }

    /// A loader that knows only the units added to it explicitly.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, create: ModuleConstructor) -> Self {
        self.modules.insert(name.to_string(), ImageSource::Builtin(create));
        self
    }

    pub fn with_factory(
        mut self,
        name: &str,
        factory: impl Fn() -> Box<dyn Module> + Send + Sync + 'static,
    ) -> Self {
        self.modules
            .insert(name.to_string(), ImageSource::Factory(Arc::new(factory)));
        self
    }
}

impl ModuleLoader for StaticLoader {
    fn open(&self, name: &str) -> Result<Option<ModuleImage>, ModuleError> {
        self.modules.get(name).map(ImageSource::open).transpose()
    }

    fn available(&self) -> Vec<String> {
        let mut names: Vec<_> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Loads modules from `<directory>/<name>.so`.
pub struct DynamicLoader {
    directory: PathBuf,
}

impl DynamicLoader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.so", name))
    }
}

impl ModuleLoader for DynamicLoader {
    fn open(&self, name: &str) -> Result<Option<ModuleImage>, ModuleError> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Ok(None);
        }
        open_library(&path).map(Some)
    }

    fn available(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(directory = %self.directory.display(), "can't scan module directory: {}", e);
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let file_name = file_name.to_str()?;
                file_name.strip_suffix(".so").map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Module for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test"
        }
        fn load(&mut self, _ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
        fn unload(&mut self, _ctx: &ModuleContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn so_suffix_is_ignored() {
        assert_eq!(normalize_module_name("net_irc.so"), "net_irc");
        assert_eq!(normalize_module_name("net_irc"), "net_irc");
        assert_eq!(normalize_module_name("so"), "so");
    }

    #[test]
    fn static_loader_opens_registered_units() {
        let loader = StaticLoader::empty()
            .with("alpha", || Box::new(Named("alpha")) as Box<dyn Module>)
            .with_factory("beta", || Box::new(Named("beta")));

        assert_eq!(loader.available(), vec!["alpha", "beta"]);

        let image = loader.open("alpha").unwrap().unwrap();
        assert_eq!(image.module().name(), "alpha");
        assert!(!image.is_shared_library());

        let reopened = image.source().open().unwrap();
        assert_eq!(reopened.module().name(), "alpha");

        assert!(loader.open("gamma").unwrap().is_none());
    }

    #[test]
    fn dynamic_loader_skips_missing_files() {
        let loader = DynamicLoader::new("/nonexistent/portico/modules");
        assert!(loader.open("net_smtp").unwrap().is_none());
        assert!(loader.available().is_empty());
    }

    #[test]
    fn dynamic_loader_lists_shared_objects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.so"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let loader = DynamicLoader::new(dir.path());
        assert_eq!(loader.available(), vec!["foo"]);
    }

    #[test]
    fn file_that_is_not_a_library_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.so"), b"not an elf file").unwrap();

        let loader = DynamicLoader::new(dir.path());
        assert!(matches!(loader.open("junk"), Err(ModuleError::Image { .. })));
    }

    #[test]
    fn library_without_entry_points_is_rejected() {
        let candidates = [
            "/lib/x86_64-linux-gnu/libc.so.6",
            "/usr/lib/x86_64-linux-gnu/libc.so.6",
            "/lib/aarch64-linux-gnu/libc.so.6",
            "/usr/lib/aarch64-linux-gnu/libc.so.6",
            "/lib64/libc.so.6",
            "/usr/lib64/libc.so.6",
            "/usr/lib/libc.so.6",
        ];
        let libc = match candidates.iter().map(Path::new).find(|p| p.is_file()) {
            Some(path) => path,
            None => return,
        };

        match open_library(libc) {
            Err(ModuleError::Image { name, message }) => {
                assert_eq!(name, libc.display().to_string());
                assert!(!message.is_empty());
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("libc opened as a module"),
        }
    }
}
