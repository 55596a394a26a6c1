// Authoritative shared-object descriptors and the byte locators behind them.
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::core::error::{Error, ErrorKind};
use crate::core::package::PackageArchive;

/// One candidate shared object in an authoritative listing. Identity within
/// a provisioning pass is `name`; several descriptors may share a name
/// across different `abi` tags.
#[derive(Clone, Debug)]
pub struct SoDescriptor {
    pub name: String,
    pub abi: String,
    pub size: u64,
    pub mod_time: SystemTime,
    pub locator: Locator,
}

/// Where the descriptor's bytes live.
#[derive(Clone)]
pub enum Locator {
    File(PathBuf),
    Archive {
        archive: Arc<dyn PackageArchive>,
        entry: String,
    },
}

impl Locator {
    pub fn open(&self) -> Result<Box<dyn Read + '_>, Error> {
        match self {
            Locator::File(path) => {
                let file = File::open(path).map_err(|err| {
                    Error::new(ErrorKind::Storage)
                        .with_message("cannot open library bytes")
                        .with_path(path)
                        .with_source(err)
                })?;
                Ok(Box::new(file))
            }
            Locator::Archive { archive, entry } => archive.open(entry),
        }
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => f.debug_tuple("File").field(path).finish(),
            Locator::Archive { entry, .. } => f.debug_tuple("Archive").field(entry).finish(),
        }
    }
}
