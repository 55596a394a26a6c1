// Core modules implementing parsing, provisioning, sources, and error modeling.
pub mod abi;
pub mod context;
pub mod descriptor;
pub mod elf;
pub mod error;
pub mod handle;
pub mod linker;
pub mod lock;
pub mod package;
pub mod provision;
pub mod sideload;
pub mod source;
