//! Purpose: Define the stable public Rust API boundary for sodepot.
//! Exports: Core types and operations needed by the CLI and embedders.
//! Role: Public, additive-only surface; hides the internal module layout.
//! Invariants: This module is the only public path intended for external use.
//! Invariants: Internal core modules may reshuffle without touching it.

pub use crate::core::abi::AbiOrder;
pub use crate::core::context::LoaderContext;
pub use crate::core::descriptor::{Locator, SoDescriptor};
pub use crate::core::elf::{read_dependencies, read_dependencies_bytes};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::handle::LazyLibraryHandle;
pub use crate::core::linker::{Dlopen, SystemLinker};
pub use crate::core::lock::DirLock;
pub use crate::core::package::{
    ArchiveEntry, PackageArchive, PackageSource, UnpackedPackage, embedded_descriptors,
};
pub use crate::core::provision::{SyncStats, lock_path_for, synchronize};
pub use crate::core::sideload::{METADATA_FILE, SideloadSource, tree_descriptors};
pub use crate::core::source::{
    DirectorySource, LibrarySource, LoadFlags, LoadOutcome, NoopSource,
};
