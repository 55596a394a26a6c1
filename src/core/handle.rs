// Load-once façade over the loader context, with a terminal cached outcome.
use std::sync::{Arc, Mutex};

use crate::core::context::LoaderContext;
use crate::core::error::{Error, ErrorKind};
use crate::core::source::LoadFlags;

enum CachedLoadResult {
    Unattempted,
    Succeeded,
    Failed(Arc<Error>),
}

/// A fixed set of required libraries that loads at most once per process.
///
/// The first `ensure_loaded` call attempts every required name in order and
/// records a terminal outcome. A failed first attempt is cached and
/// re-surfaced unchanged by every later call — the subsystem never retries,
/// so a transient failure stays permanent for this process's lifetime.
pub struct LazyLibraryHandle {
    names: Vec<String>,
    context: Arc<LoaderContext>,
    smoke_test: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    state: Mutex<CachedLoadResult>,
}

impl LazyLibraryHandle {
    pub fn new<I, S>(context: Arc<LoaderContext>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            context,
            smoke_test: None,
            state: Mutex::new(CachedLoadResult::Unattempted),
        }
    }

    /// Callback run once after a successful first load. Some OS loaders
    /// defer real work past the nominal load call; a `false` result here
    /// turns into a cached `Link` failure.
    pub fn with_smoke_test(mut self, test: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.smoke_test = Some(Box::new(test));
        self
    }

    pub fn ensure_loaded(&self) -> Result<(), Arc<Error>> {
        let mut state = self.state.lock().expect("lock");
        match &*state {
            CachedLoadResult::Succeeded => Ok(()),
            CachedLoadResult::Failed(err) => Err(Arc::clone(err)),
            CachedLoadResult::Unattempted => match self.attempt() {
                Ok(()) => {
                    *state = CachedLoadResult::Succeeded;
                    Ok(())
                }
                Err(err) => {
                    let err = Arc::new(err);
                    *state = CachedLoadResult::Failed(Arc::clone(&err));
                    Err(err)
                }
            },
        }
    }

    pub fn try_load(&self) -> bool {
        self.ensure_loaded().is_ok()
    }

    pub fn last_error(&self) -> Option<Arc<Error>> {
        match &*self.state.lock().expect("lock") {
            CachedLoadResult::Failed(err) => Some(Arc::clone(err)),
            _ => None,
        }
    }

    fn attempt(&self) -> Result<(), Error> {
        for name in &self.names {
            self.context.load_library(name, LoadFlags::NONE)?;
        }
        if let Some(test) = &self.smoke_test {
            if !test() {
                return Err(Error::new(ErrorKind::Link).with_message("post-load smoke test failed"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LazyLibraryHandle;
    use crate::core::context::LoaderContext;
    use crate::core::elf::fixtures;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::linker::test_support::RecordingLinker;
    use crate::core::source::{DirectorySource, LibrarySource, LoadFlags, LoadOutcome};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn context_with_lib(names: &[&str]) -> (Arc<LoaderContext>, RecordingLinker, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in names {
            std::fs::write(dir.path().join(name), fixtures::elf64(true, &[])).expect("write lib");
        }
        let linker = RecordingLinker::default();
        let context = Arc::new(LoaderContext::new(
            vec![Box::new(DirectorySource::new(dir.path()))],
            Box::new(linker.clone()),
        ));
        (context, linker, dir)
    }

    #[test]
    fn success_is_cached_across_calls() {
        let (context, linker, _dir) = context_with_lib(&["libx.so"]);
        let handle = LazyLibraryHandle::new(context, ["libx.so"]);
        assert!(handle.try_load());
        assert!(handle.try_load());
        assert!(handle.ensure_loaded().is_ok());
        assert_eq!(linker.loads(), ["libx.so"]);
        assert!(handle.last_error().is_none());
    }

    #[test]
    fn failure_is_cached_as_the_same_instance() {
        struct CountingFailSource {
            calls: Arc<AtomicUsize>,
        }
        impl LibrarySource for CountingFailSource {
            fn load_library(
                &self,
                _context: &LoaderContext,
                name: &str,
                _flags: LoadFlags,
            ) -> Result<LoadOutcome, Error> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::new(ErrorKind::Link)
                    .with_message("refused")
                    .with_library(name))
            }
            fn locate(&self, _name: &str) -> Option<PathBuf> {
                None
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let context = Arc::new(LoaderContext::new(
            vec![Box::new(CountingFailSource {
                calls: Arc::clone(&calls),
            })],
            Box::new(RecordingLinker::default()),
        ));
        let handle = LazyLibraryHandle::new(context, ["libbroken.so"]);

        let first = handle.ensure_loaded().expect_err("must fail");
        let second = handle.ensure_loaded().expect_err("must fail");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), ErrorKind::Link);
        // The source was consulted exactly once; later calls reuse the
        // cached outcome.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let last = handle.last_error().expect("cached error");
        assert!(Arc::ptr_eq(&first, &last));
    }

    #[test]
    fn unresolved_names_surface_as_cached_failures() {
        let linker = RecordingLinker::default();
        let context = Arc::new(LoaderContext::new(Vec::new(), Box::new(linker)));
        let handle = LazyLibraryHandle::new(context, ["libnowhere.so"]);
        assert!(!handle.try_load());
        let err = handle.last_error().expect("cached error");
        assert_eq!(err.kind(), ErrorKind::UnresolvedDependency);
    }

    #[test]
    fn smoke_test_failure_is_a_cached_link_error() {
        let (context, _linker, _dir) = context_with_lib(&["libx.so"]);
        let runs = Arc::new(Mutex::new(0usize));
        let counted = Arc::clone(&runs);
        let handle = LazyLibraryHandle::new(context, ["libx.so"]).with_smoke_test(move || {
            *counted.lock().expect("lock") += 1;
            false
        });

        let first = handle.ensure_loaded().expect_err("must fail");
        assert_eq!(first.kind(), ErrorKind::Link);
        let second = handle.ensure_loaded().expect_err("must fail");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*runs.lock().expect("lock"), 1);
    }

    #[test]
    fn smoke_test_passing_keeps_success() {
        let (context, _linker, _dir) = context_with_lib(&["libx.so"]);
        let handle = LazyLibraryHandle::new(context, ["libx.so"]).with_smoke_test(|| true);
        assert!(handle.try_load());
    }
}
