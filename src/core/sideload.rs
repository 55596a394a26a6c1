// Sideload tree: shared objects delivered outside the application package,
// one subdirectory per ABI, each with a metadata manifest.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::abi::AbiOrder;
use crate::core::context::LoaderContext;
use crate::core::descriptor::{Locator, SoDescriptor};
use crate::core::error::{Error, ErrorKind};
use crate::core::provision;
use crate::core::source::{DirectorySource, LibrarySource, LoadFlags, LoadOutcome};

pub const METADATA_FILE: &str = "metadata.txt";
const LIBRARY_SUFFIX: &str = ".so";

/// Descriptors for every manifest mapping in the tree. Manifest lines are
/// `<logicalKey> <backingFilename>`; the library name is the key with the
/// shared-object suffix appended, and size/mtime come from the backing file.
pub fn tree_descriptors(root: &Path) -> Result<Vec<SoDescriptor>, Error> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        // A tree that has not been delivered yet provides nothing.
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(storage("cannot list sideload tree", root, err)),
    };
    for abi_entry in entries {
        let abi_entry = abi_entry.map_err(|err| storage("cannot list sideload tree", root, err))?;
        if !abi_entry.path().is_dir() {
            continue;
        }
        let Some(abi) = abi_entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let manifest = abi_entry.path().join(METADATA_FILE);
        let text = match fs::read_to_string(&manifest) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(storage("cannot read manifest", &manifest, err)),
        };
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(key), Some(backing), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::new(ErrorKind::Storage)
                    .with_message(format!("malformed manifest line {}", index + 1))
                    .with_path(&manifest));
            };
            let backing_path = abi_entry.path().join(backing);
            let meta = fs::metadata(&backing_path)
                .map_err(|err| storage("cannot stat backing file", &backing_path, err))?;
            let mod_time = meta
                .modified()
                .map_err(|err| storage("cannot stat backing file", &backing_path, err))?;
            out.push(SoDescriptor {
                name: format!("{key}{LIBRARY_SUFFIX}"),
                abi: abi.clone(),
                size: meta.len(),
                mod_time,
                locator: Locator::File(backing_path),
            });
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.abi.cmp(&b.abi)));
    Ok(out)
}

/// Directory source over a private extraction directory, synchronized
/// against the sideload tree once at construction.
pub struct SideloadSource {
    inner: DirectorySource,
}

impl SideloadSource {
    pub fn new(
        root: &Path,
        extraction_dir: impl Into<PathBuf>,
        abi_order: &AbiOrder,
    ) -> Result<Self, Error> {
        let dir = extraction_dir.into();
        let descriptors = tree_descriptors(root)?;
        let stats = provision::synchronize(&dir, &descriptors, abi_order)?;
        debug!(root = %root.display(), dir = %dir.display(), ?stats, "sideload tree provisioned");
        Ok(Self {
            inner: DirectorySource::new(dir).resolve_dependencies(true),
        })
    }
}

impl LibrarySource for SideloadSource {
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
