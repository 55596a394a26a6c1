// Package-embedded payload: native libraries shipped inside the application
// package under `lib/<abi>/<name>`.
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::core::abi::AbiOrder;
use crate::core::context::LoaderContext;
use crate::core::descriptor::{Locator, SoDescriptor};
use crate::core::error::{Error, ErrorKind};
use crate::core::provision;
use crate::core::source::{DirectorySource, LibrarySource, LoadFlags, LoadOutcome};

/// One payload entry: a package-relative path plus the uncompressed size and
/// modification time recorded by the packaging step.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub mod_time: SystemTime,
}

/// Read-only view of an application package's embedded payload.
pub trait PackageArchive: Send + Sync {
    fn entries(&self) -> Result<Vec<ArchiveEntry>, Error>;
    fn open(&self, entry: &str) -> Result<Box<dyn Read + '_>, Error>;
}

/// A package extracted on disk; entries are plain files under the root.
pub struct UnpackedPackage {
    root: PathBuf,
}

impl UnpackedPackage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageArchive for UnpackedPackage {
    fn entries(&self) -> Result<Vec<ArchiveEntry>, Error> {
        let lib_root = self.root.join("lib");
        let mut out = Vec::new();
        let abi_dirs = match fs::read_dir(&lib_root) {
            Ok(iter) => iter,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(storage("cannot list package payload", &lib_root, err)),
        };
        for abi_dir in abi_dirs {
            let abi_dir = abi_dir.map_err(|err| storage("cannot list package payload", &lib_root, err))?;
            if !abi_dir.path().is_dir() {
                continue;
            }
            let Some(abi) = abi_dir.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let files = fs::read_dir(abi_dir.path())
                .map_err(|err| storage("cannot list package payload", &abi_dir.path(), err))?;
            for file in files {
                let file = file.map_err(|err| storage("cannot list package payload", &abi_dir.path(), err))?;
                let Some(name) = file.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                let meta = file
                    .metadata()
                    .map_err(|err| storage("cannot stat package entry", &file.path(), err))?;
                if !meta.is_file() {
                    continue;
                }
                let mod_time = meta
                    .modified()
                    .map_err(|err| storage("cannot stat package entry", &file.path(), err))?;
                out.push(ArchiveEntry {
                    path: format!("lib/{abi}/{name}"),
                    size: meta.len(),
                    mod_time,
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn open(&self, entry: &str) -> Result<Box<dyn Read + '_>, Error> {
        let path = self.root.join(entry);
        let file = File::open(&path)
            .map_err(|err| storage("cannot open package entry", &path, err))?;
        Ok(Box::new(file))
    }
}

/// Descriptors for every payload entry matching `lib/<abi>/<name>`.
pub fn embedded_descriptors(archive: &Arc<dyn PackageArchive>) -> Result<Vec<SoDescriptor>, Error> {
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let Some((abi, name)) = split_library_path(&entry.path) else {
            continue;
        };
        out.push(SoDescriptor {
            name: name.to_string(),
            abi: abi.to_string(),
            size: entry.size,
            mod_time: entry.mod_time,
            locator: Locator::Archive {
                archive: Arc::clone(archive),
                entry: entry.path.clone(),
            },
        });
    }
    Ok(out)
}

// `lib/<abi>/<name>`, exactly three components.
fn split_library_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.split('/');
    if parts.next()? != "lib" {
        return None;
    }
    let abi = parts.next()?;
    let name = parts.next()?;
    if parts.next().is_some() || abi.is_empty() || name.is_empty() {
        return None;
    }
    Some((abi, name))
}

/// Directory source over a private extraction directory, synchronized
/// against the package payload once at construction. Construction fails if
/// the provisioning pass fails; the source is unusable without a converged
/// directory.
pub struct PackageSource {
    inner: DirectorySource,
}

impl PackageSource {
    pub fn new(
        archive: Arc<dyn PackageArchive>,
        extraction_dir: impl Into<PathBuf>,
        abi_order: &AbiOrder,
    ) -> Result<Self, Error> {
        let dir = extraction_dir.into();
        let descriptors = embedded_descriptors(&archive)?;
        let stats = provision::synchronize(&dir, &descriptors, abi_order)?;
        debug!(dir = %dir.display(), ?stats, "package payload provisioned");
        Ok(Self {
            inner: DirectorySource::new(dir).resolve_dependencies(true),
        })
    }
}

impl LibrarySource for PackageSource {
    fn load_library(
        &self,
        context: &LoaderContext,
        name: &str,
        flags: LoadFlags,
    ) -> Result<LoadOutcome, Error> {
        self.inner.load_library(context, name, flags)
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        self.inner.locate(name)
    }
}

fn storage(message: &str, path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::Storage)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}
