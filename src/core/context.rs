// The constructed-once loading context: ordered sources plus the linker.
//
// Replaces a process-wide mutable registry; anything that loads a library
// holds a reference to one of these instead.
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::linker::SystemLinker;
use crate::core::source::{LibrarySource, LoadFlags, LoadOutcome};

pub struct LoaderContext {
    sources: Vec<Box<dyn LibrarySource>>,
    linker: Box<dyn SystemLinker>,
    loaded: Mutex<HashSet<String>>,
    resolving: Mutex<HashSet<String>>,
}

impl LoaderContext {
    /// Sources are tried in the given order on every request.
    pub fn new(sources: Vec<Box<dyn LibrarySource>>, linker: Box<dyn SystemLinker>) -> Self {
        Self {
            sources,
            linker,
            loaded: Mutex::new(HashSet::new()),
            resolving: Mutex::new(HashSet::new()),
        }
    }

    /// Load `name` through the chain. The first source to answer `Loaded`
    /// or `ImplicitlyProvided` wins; `NotFound` falls through; exhausting
    /// the chain is an `UnresolvedDependency` error. A name that already
    /// loaded is answered from the loaded set without touching any source.
    pub fn load_library(&self, name: &str, flags: LoadFlags) -> Result<LoadOutcome, Error> {
        if self.loaded.lock().expect("lock").contains(name) {
            return Ok(LoadOutcome::Loaded);
        }
        // Well-formed binaries cannot cycle through their dependency
        // tables; seeing a name twice on one resolution stack means the
        // input is malformed.
        if !self.resolving.lock().expect("lock").insert(name.to_string()) {
            return Err(Error::new(ErrorKind::MalformedBinary)
                .with_message("dependency cycle")
                .with_library(name));
        }
        let result = self.try_sources(name, flags);
        self.resolving.lock().expect("lock").remove(name);
        match result {
            Ok(Some(outcome)) => {
                self.loaded.lock().expect("lock").insert(name.to_string());
                debug!(name, ?outcome, "resolved");
                Ok(outcome)
            }
            Ok(None) => Err(Error::new(ErrorKind::UnresolvedDependency)
                .with_message("no source could provide the library")
                .with_library(name)),
            Err(err) => Err(err),
        }
    }

    /// Path of `name` in the first source that can locate it.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.sources.iter().find_map(|source| source.locate(name))
    }

    pub fn linker(&self) -> &dyn SystemLinker {
        self.linker.as_ref()
    }

    fn try_sources(&self, name: &str, flags: LoadFlags) -> Result<Option<LoadOutcome>, Error> {
        for source in &self.sources {
            match source.load_library(self, name, flags)? {
                LoadOutcome::NotFound => continue,
                outcome => return Ok(Some(outcome)),
            }
        }
        Ok(None)
    }
}
