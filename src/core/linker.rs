// The opaque OS load primitive behind a trait seam.
use std::path::Path;

use crate::core::error::{Error, ErrorKind};

pub trait SystemLinker: Send + Sync {
    /// Map the shared object at `path` into the process. One-way: nothing in
    /// this subsystem ever unloads.
    fn load(&self, path: &Path) -> Result<(), Error>;
}

/// `dlopen` with immediate binding. Handles are never closed; libraries stay
/// mapped for the process lifetime.
pub struct Dlopen;

#[cfg(unix)]
impl SystemLinker for Dlopen {
    fn load(&self, path: &Path) -> Result<(), Error> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|err| {
            Error::new(ErrorKind::Link)
                .with_message("path contains an interior NUL")
                .with_path(path)
                .with_source(err)
        })?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(Error::new(ErrorKind::Link)
                .with_message(dlerror_text())
                .with_path(path));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn dlerror_text() -> String {
    use std::ffi::CStr;

    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic linker failure".to_string();
    }
    unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
}

#[cfg(not(unix))]
impl SystemLinker for Dlopen {
    fn load(&self, path: &Path) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Link)
            .with_message("dynamic loading is not supported on this platform")
            .with_path(path))
    }
}
