// Library sources: the places a named shared object can come from.
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::context::LoaderContext;
use crate::core::elf;
use crate::core::error::Error;

/// How a source answered a load request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    /// This source cannot provide the library; try the next one.
    NotFound,
    /// The library was handed to the system linker.
    Loaded,
    /// The OS loader will resolve this name on its own search path; nothing
    /// was loaded here.
    ImplicitlyProvided,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoadFlags(u32);

impl LoadFlags {
    pub const NONE: LoadFlags = LoadFlags(0);
    /// The request may be answered with [`LoadOutcome::ImplicitlyProvided`].
    pub const ALLOW_IMPLICIT_PROVISION: LoadFlags = LoadFlags(1);

    pub fn contains(self, other: LoadFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: LoadFlags) -> LoadFlags {
        LoadFlags(self.0 | other.0)
    }
}

pub trait LibrarySource: Send + Sync {
    fn load_library(
        &self,
        context: &LoaderContext,
        name: &str,
        flags: LoadFlags,
    ) -> Result<LoadOutcome, Error>;

    fn locate(&self, name: &str) -> Option<PathBuf>;
}

/// Loads libraries from one flat directory.
pub struct DirectorySource {
    dir: PathBuf,
    resolve_dependencies: bool,
    on_library_path: bool,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            resolve_dependencies: false,
            on_library_path: false,
        }
    }

    /// Parse each library's dynamic table and pre-load its dependencies
    /// through the whole chain before handing it to the linker.
    pub fn resolve_dependencies(mut self, resolve: bool) -> Self {
        self.resolve_dependencies = resolve;
        self
    }

    /// Mark the directory as already on the OS loader's search path. Such a
    /// source answers `ImplicitlyProvided` when the request allows it.
    pub fn on_library_path(mut self, on_path: bool) -> Self {
        self.on_library_path = on_path;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LibrarySource for DirectorySource {
    fn load_library(
        &self,
        context: &LoaderContext,
        name: &str,
        flags: LoadFlags,
    ) -> Result<LoadOutcome, Error> {
        let Some(path) = self.locate(name) else {
            return Ok(LoadOutcome::NotFound);
        };
        if self.on_library_path && flags.contains(LoadFlags::ALLOW_IMPLICIT_PROVISION) {
            debug!(name, dir = %self.dir.display(), "on the system search path");
            return Ok(LoadOutcome::ImplicitlyProvided);
        }
        if self.resolve_dependencies {
            for dep in elf::read_dependencies(&path)? {
                // Absolute paths are the OS loader's business.
                if dep.starts_with('/') {
                    continue;
                }
                context.load_library(&dep, flags.with(LoadFlags::ALLOW_IMPLICIT_PROVISION))?;
            }
        }
        context.linker().load(&path)?;
        debug!(name, path = %path.display(), "loaded");
        Ok(LoadOutcome::Loaded)
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }
}

/// Reports every library as loaded without touching the filesystem; stubs
/// the whole subsystem out for callers that bring their own loading.
pub struct NoopSource;

impl LibrarySource for NoopSource {
    fn load_library(
        &self,
        _context: &LoaderContext,
        _name: &str,
        _flags: LoadFlags,
    ) -> Result<LoadOutcome, Error> {
        Ok(LoadOutcome::Loaded)
    }

    fn locate(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}
