//! Rebind - dynamic symbol resolution and lazy-binding interception for
//! Mach-O images.
//!
//! Rebind locates the indirect symbol pointer slots that the dynamic linker
//! uses to dispatch calls to imported functions and rewrites them in place,
//! redirecting calls to caller-supplied replacements while preserving the
//! original targets for chaining. It also resolves symbol addresses directly
//! from an image's symbol table and exports trie.
//!
//! # Modules
//!
//! - [`image`] - Enumeration of loaded images and load notifications
//! - [`parser`] - Load-command parsing into typed, bounds-checked views
//! - [`index`] - Symbol name to pointer-slot resolution
//! - [`rewrite`] - Scoped memory-protection toggling and atomic slot swaps
//! - [`engine`] - The rebinding engine and its process-wide registry
//! - [`resolver`] - Symbol address lookup via nlist scan and exports trie
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. Parser failures are
//! contained to the single image being parsed; rewriter failures are
//! contained to the single slot being rewritten. Nothing in this crate
//! terminates the host process.

pub mod engine;
pub mod image;
pub mod index;
pub mod macho;
pub mod parser;
pub mod resolver;
pub mod rewrite;

#[cfg(test)]
pub(crate) mod testutil;

/// Consolidated error type for all rebind operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("image enumeration is not available on this platform")]
    UnsupportedPlatform,

    #[error("malformed image: {0}")]
    MalformedImage(String),

    #[error("memory protection change denied (code {code})")]
    ProtectionDenied { code: i32 },

    #[error("symbol '{0}' already has an active rebinding")]
    AlreadyRegistered(String),

    #[error("symbol '{0}' has no active rebinding")]
    NotRegistered(String),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use engine::{global, FnPtr, Hooked, Rebinder, RebindingRequest};
pub use image::{find_image, DyldImageSource, Image, ImageSource};
pub use parser::ParsedImage;
pub use resolver::{for_each_symbol, resolve_named, resolve_symbol};
