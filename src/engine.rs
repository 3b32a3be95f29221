//! The rebinding engine and its process-wide registry.
//!
//! [`Rebinder`] orchestrates the other components: it accepts a set of
//! (symbol name, replacement) pairs, resolves and rewrites every matching
//! pointer slot across all currently loaded images, and keeps the registry
//! needed to apply the same rebindings to images loaded later and to undo
//! them on request.
//!
//! All registry access and all slot rewrites are serialized by a single
//! lock, so two threads can never race to capture the "original" value for
//! the same symbol. The engine spawns no threads and performs no I/O.

use crate::image::{Image, ImageSource};
use crate::index::resolve_slots;
use crate::parser::ParsedImage;
use crate::rewrite::rewrite_slot;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, warn};

/// A function address that is safe to share across threads.
///
/// Function pointers are just addresses into code, but Rust does not
/// implement `Send`/`Sync` for raw pointers automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FnPtr(pub *const libc::c_void);

// SAFETY: the wrapped address is never dereferenced by this crate; it is
// stored and written into pointer slots as data.
unsafe impl Send for FnPtr {}
unsafe impl Sync for FnPtr {}

impl FnPtr {
    pub fn from_addr(addr: usize) -> Self {
        Self(addr as *const libc::c_void)
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

/// A caller-supplied (symbol name, replacement function) pair.
#[derive(Debug, Clone)]
pub struct RebindingRequest {
    pub name: String,
    pub replacement: FnPtr,
}

impl RebindingRequest {
    pub fn new(name: impl Into<String>, replacement: FnPtr) -> Self {
        Self {
            name: name.into(),
            replacement,
        }
    }
}

/// Outcome of a successful [`Rebinder::submit`] for one symbol.
#[derive(Debug, Clone, Copy)]
pub struct Hooked {
    /// The value captured from the first rewritten slot, for chaining.
    /// `None` when no currently loaded image binds the symbol; the rebinding
    /// stays registered and binds when a matching image loads.
    pub original: Option<FnPtr>,
    /// Number of slots rewritten by this submission.
    pub slots: usize,
}

struct RewrittenSlot {
    image: usize,
    address: usize,
    previous: usize,
    restore_prot: i32,
}

struct RebindingRecord {
    replacement: FnPtr,
    original: Option<FnPtr>,
    slots: Vec<RewrittenSlot>,
    /// Header addresses of images this record has been applied to.
    applied: HashSet<usize>,
}

#[derive(Default)]
struct Registry {
    records: HashMap<String, RebindingRecord>,
    /// Images that failed to parse; skipped on every later pass.
    failed_images: HashSet<usize>,
}

/// The rebinding engine over some source of loaded images.
pub struct Rebinder<S: ImageSource> {
    source: S,
    registry: Mutex<Registry>,
}

impl<S: ImageSource> Rebinder<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register `requests` and apply them to every currently loaded image.
    ///
    /// Returns one entry per requested symbol. The first successful rewrite
    /// for a symbol captures that symbol's original pointer; all further
    /// slots for the same symbol, in any image, are rewritten without
    /// re-capturing. Re-registering a symbol that already has an active
    /// rebinding is rejected with [`Error::AlreadyRegistered`] and leaves
    /// the active rebinding untouched.
    pub fn submit(
        &self,
        requests: Vec<RebindingRequest>,
    ) -> HashMap<String, Result<Hooked>> {
        let mut registry = self.registry.lock().unwrap();
        let mut results: HashMap<String, Result<Hooked>> = HashMap::new();
        let mut fresh: Vec<String> = Vec::new();

        for request in requests {
            if registry.records.contains_key(&request.name) {
                results.insert(
                    request.name.clone(),
                    Err(Error::AlreadyRegistered(request.name)),
                );
                continue;
            }
            registry.records.insert(
                request.name.clone(),
                RebindingRecord {
                    replacement: request.replacement,
                    original: None,
                    slots: Vec::new(),
                    applied: HashSet::new(),
                },
            );
            fresh.push(request.name);
        }

        if fresh.is_empty() {
            return results;
        }

        let mut errors: HashMap<String, Error> = HashMap::new();
        for image in self.source.images() {
            apply_to_image(&mut registry, &image, Some(&fresh), &mut errors);
        }

        for name in fresh {
            let outcome = match errors.remove(&name) {
                Some(err) => Err(err),
                None => {
                    let record = &registry.records[&name];
                    Ok(Hooked {
                        original: record.original,
                        slots: record.slots.len(),
                    })
                }
            };
            results.insert(name, outcome);
        }
        results
    }

    /// Restore every slot rewritten for `name` to its pre-rewrite value and
    /// drop the record. A later `submit` for the same name starts fresh.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();
        let record = registry
            .records
            .remove(name)
            .ok_or_else(|| Error::NotRegistered(name.to_string()))?;

        let mut first_err = None;
        for slot in record.slots.iter().rev() {
            match unsafe { rewrite_slot(slot.address, slot.previous, slot.restore_prot) } {
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        "failed to restore slot 0x{:x} in image 0x{:x}: {}",
                        slot.address, slot.image, err
                    );
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        debug!("unregistered '{}' ({} slots)", name, record.slots.len());
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The original pointer captured for `name`, once a slot has been
    /// rewritten for it.
    pub fn original(&self, name: &str) -> Option<FnPtr> {
        let registry = self.registry.lock().unwrap();
        registry.records.get(name).and_then(|record| record.original)
    }

    /// Apply the full current registry to one image. This is the code path
    /// behind load notifications; startup enumeration goes through the same
    /// logic per image, which keeps old and new images consistent.
    pub fn rebind_image(&self, image: &Image) {
        let mut registry = self.registry.lock().unwrap();
        let mut errors = HashMap::new();
        apply_to_image(&mut registry, image, None, &mut errors);
        for (name, err) in errors {
            warn!(
                "rebinding '{}' in image at 0x{:x} failed: {}",
                name,
                image.header_addr(),
                err
            );
        }
    }
}

/// Apply records (all of them, or just `only`) to one image. Parse failures
/// mark the image failed and skip it entirely; rewrite failures are recorded
/// per symbol and do not roll back slots already rewritten.
fn apply_to_image(
    registry: &mut Registry,
    image: &Image,
    only: Option<&[String]>,
    errors: &mut HashMap<String, Error>,
) {
    let base = image.header_addr();
    if registry.failed_images.contains(&base) {
        return;
    }

    let parsed = match ParsedImage::parse(image) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("skipping unparseable image at 0x{:x}: {}", base, err);
            registry.failed_images.insert(base);
            return;
        }
    };

    let names: Vec<String> = match only {
        Some(list) => list.to_vec(),
        None => registry.records.keys().cloned().collect(),
    };

    for name in names {
        let Some(record) = registry.records.get_mut(&name) else {
            continue;
        };
        if record.applied.contains(&base) {
            continue;
        }

        for slot in resolve_slots(&parsed, &name) {
            if record.slots.iter().any(|s| s.address == slot.address) {
                continue;
            }
            match unsafe {
                rewrite_slot(slot.address, record.replacement.addr(), slot.restore_prot)
            } {
                Ok(previous) => {
                    if record.original.is_none() && previous != record.replacement.addr() {
                        record.original = Some(FnPtr::from_addr(previous));
                    }
                    record.slots.push(RewrittenSlot {
                        image: base,
                        address: slot.address,
                        previous,
                        restore_prot: slot.restore_prot,
                    });
                }
                Err(err) => {
                    warn!(
                        "rewrite of slot 0x{:x} for '{}' failed: {}",
                        slot.address, name, err
                    );
                    errors.entry(name.clone()).or_insert(err);
                }
            }
        }
        record.applied.insert(base);
    }
}

pub use process::global;

mod process {
    use super::Rebinder;
    use crate::image::{DyldImageSource, Image, ImageSource};
    use crate::Result;
    use std::sync::OnceLock;

    static GLOBAL: OnceLock<Rebinder<DyldImageSource>> = OnceLock::new();

    fn dispatch(image: Image) {
        if let Some(rebinder) = GLOBAL.get() {
            rebinder.rebind_image(&image);
        }
    }

    /// The process-wide rebinder over the dyld image list, created on first
    /// use and never torn down. The first call registers the dyld add-image
    /// callback so rebindings follow libraries loaded later.
    pub fn global() -> Result<&'static Rebinder<DyldImageSource>> {
        if let Some(rebinder) = GLOBAL.get() {
            return Ok(rebinder);
        }
        let source = DyldImageSource::new()?;
        let rebinder = GLOBAL.get_or_init(|| Rebinder::new(source));
        rebinder.source.on_image_loaded(dispatch)?;
        Ok(rebinder)
    }
}
