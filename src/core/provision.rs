//! Purpose: One-shot synchronization of an extraction directory against an
//! authoritative shared-object descriptor set.
//! Exports: `synchronize`, `SyncStats`, `lock_path_for`.
//! Role: The only code that mutates a provisioning directory.
//! Invariants: Every mutation happens inside one `DirLock` acquisition.
//! Invariants: A pass that returns `Ok` left the directory equal to the
//! desired set; a failed pass may leave it partial and is fatal to callers.
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::Serialize;
use tracing::debug;

use crate::core::abi::AbiOrder;
use crate::core::descriptor::SoDescriptor;
use crate::core::error::{Error, ErrorKind};
use crate::core::lock::DirLock;

const COPY_BUF_LEN: usize = 64 * 1024;

/// What one provisioning pass did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SyncStats {
    pub kept: usize,
    pub extracted: usize,
    pub deleted: usize,
}

/// Well-known lock path guarding `dir`: a sibling file, so the directory
/// itself stays a flat set of extracted libraries.
pub fn lock_path_for(dir: &Path) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "depot".into());
    name.push(".lock");
    match dir.parent() {
        Some(parent) => parent.join(&name),
        None => PathBuf::from(&name),
    }
}

/// Converge `dir` on the best-ABI variant of every descriptor in
/// `authoritative`. Stale and extra files are deleted, missing ones are
/// extracted with their descriptor's size and modification time, and the
/// whole pass runs under the cross-process lock for `dir`.
pub fn synchronize(
    dir: &Path,
    authoritative: &[SoDescriptor],
    abi_order: &AbiOrder,
) -> Result<SyncStats, Error> {
    fs::create_dir_all(dir).map_err(|err| storage("cannot create directory", dir, err))?;
    let _lock = DirLock::acquire(&lock_path_for(dir))?;

    let mut desired = choose_variants(authoritative, abi_order)?;
    let mut stats = SyncStats::default();

    let entries = fs::read_dir(dir).map_err(|err| storage("cannot list directory", dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| storage("cannot list directory", dir, err))?;
        let satisfied = entry
            .file_name()
            .to_str()
            .filter(|name| {
                desired
                    .get(*name)
                    .is_some_and(|desc| entry_matches(&entry, desc))
            })
            .map(str::to_owned);
        match satisfied {
            Some(name) => {
                desired.remove(&name);
                stats.kept += 1;
            }
            None => {
                debug!(path = %entry.path().display(), "removing stale entry");
                fs::remove_file(entry.path())
                    .map_err(|err| storage("cannot delete stale entry", &entry.path(), err))?;
                stats.deleted += 1;
            }
        }
    }

    let mut remaining: Vec<&SoDescriptor> = desired.into_values().collect();
    remaining.sort_by(|a, b| a.name.cmp(&b.name));
    let mut buf = vec![0u8; COPY_BUF_LEN];
    for desc in remaining {
        extract(dir, desc, &mut buf)?;
        stats.extracted += 1;
    }

    sync_dir(dir)?;
    debug!(dir = %dir.display(), ?stats, "synchronized");
    Ok(stats)
}

// One descriptor per name: the best-ranked supported ABI wins; ties keep
// the earliest listing entry; unsupported tags drop out entirely.
fn choose_variants<'a>(
    authoritative: &'a [SoDescriptor],
    abi_order: &AbiOrder,
) -> Result<HashMap<String, &'a SoDescriptor>, Error> {
    let mut best: HashMap<String, (usize, &'a SoDescriptor)> = HashMap::new();
    for desc in authoritative {
        if desc.name.contains('/') || desc.name.contains('\\') {
            return Err(Error::new(ErrorKind::Storage)
                .with_message("descriptor name contains a path separator")
                .with_library(&desc.name));
        }
        let Some(rank) = abi_order.rank(&desc.abi) else {
            continue;
        };
        match best.get(&desc.name) {
            Some((current, _)) if *current <= rank => {}
            _ => {
                best.insert(desc.name.clone(), (rank, desc));
            }
        }
    }
    Ok(best
        .into_iter()
        .map(|(name, (_, desc))| (name, desc))
        .collect())
}

fn entry_matches(entry: &fs::DirEntry, desc: &SoDescriptor) -> bool {
    let Ok(meta) = entry.metadata() else {
        return false;
    };
    if !meta.is_file() || meta.len() != desc.size {
        return false;
    }
    // Whole-second comparison: archive formats and some filesystems drop
    // sub-second precision.
    match (
        meta.modified().ok().and_then(unix_secs),
        unix_secs(desc.mod_time),
    ) {
        (Some(actual), Some(expected)) => actual == expected,
        _ => false,
    }
}

fn unix_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_secs())
}

fn extract(dir: &Path, desc: &SoDescriptor, buf: &mut [u8]) -> Result<(), Error> {
    let dest = dir.join(&desc.name);
    debug!(name = %desc.name, abi = %desc.abi, size = desc.size, "extracting");
    let mut reader = desc.locator.open()?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&dest)
        .map_err(|err| storage("cannot create extracted file", &dest, err))?;
    // Reserving the final size up front keeps the file contiguous and makes
    // an out-of-space condition surface before any bytes move.
    file.allocate(desc.size)
        .map_err(|err| storage("cannot reserve file space", &dest, err))?;

    let mut file = file;
    loop {
        let read = reader
            .read(buf)
            .map_err(|err| storage("cannot read library bytes", &dest, err))?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])
            .map_err(|err| storage("cannot write extracted file", &dest, err))?;
    }
    file.sync_all()
        .map_err(|err| storage("cannot flush extracted file", &dest, err))?;
    set_executable(&file, &dest)?;
    // Stamped last: a copy interrupted earlier keeps its creation-time
    // mtime and fails the staleness check on the next pass.
    file.set_modified(desc.mod_time)
        .map_err(|err| storage("cannot stamp modification time", &dest, err))?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(file: &File, dest: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(fs::Permissions::from_mode(0o755))
        .map_err(|err| storage("cannot mark file executable", dest, err))
}

#[cfg(not(unix))]
fn set_executable(_file: &File, _dest: &Path) -> Result<(), Error> {
    Ok(())
}

// The file creations above are only durable once the directory itself is
// flushed.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), Error> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|err| storage("cannot flush directory", dir, err))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), Error> {
    Ok(())
}

fn storage(message: &str, path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::Storage)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}
