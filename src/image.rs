//! Enumeration of Mach-O images mapped into the current process.
//!
//! An [`Image`] is an opaque handle to one loaded container: its header
//! address, an optional file path, and its load-order index. Images are
//! created when the dynamic linker maps them and persist for the process
//! lifetime; unloading is out of scope.
//!
//! [`ImageSource`] is the seam between the engine and the platform: the
//! dyld-backed [`DyldImageSource`] serves real processes, while tests supply
//! their own source over synthetic images.

use crate::Result;

/// Handle to one loaded Mach-O image.
#[derive(Debug, Clone)]
pub struct Image {
    header: usize,
    path: Option<String>,
    index: u32,
}

impl Image {
    /// Wrap a raw Mach-O header address.
    ///
    /// # Safety
    ///
    /// `header` must be the address of a `mach_header_64` at the start of a
    /// fully mapped Mach-O image that stays mapped for the lifetime of the
    /// returned handle and everything derived from it.
    pub unsafe fn from_raw_parts(header: usize, path: Option<String>, index: u32) -> Self {
        Self {
            header,
            path,
            index,
        }
    }

    /// Address of the image's `mach_header_64`.
    pub fn header_addr(&self) -> usize {
        self.header
    }

    /// File path the image was loaded from, when known.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Load-order index; the main executable is 0.
    pub fn load_index(&self) -> u32 {
        self.index
    }
}

/// Hook invoked once per newly mapped image.
pub type ImageHook = fn(Image);

/// Source of loaded images and load notifications.
pub trait ImageSource {
    /// Every image mapped at call time, in load order (main executable
    /// first).
    fn images(&self) -> Vec<Image>;

    /// Register `hook` to run once per newly mapped image. Registration is
    /// idempotent: only the first hook is kept, later calls are no-ops.
    fn on_image_loaded(&self, hook: ImageHook) -> Result<()>;
}

/// Find a loaded image by full path, or by trailing path component when
/// `name` does not start with `/`.
pub fn find_image<S: ImageSource>(source: &S, name: &str) -> Option<Image> {
    source.images().into_iter().find(|image| {
        let Some(path) = image.path() else {
            return false;
        };
        if name.starts_with('/') {
            path == name
        } else {
            path.rsplit('/').next() == Some(name)
        }
    })
}

#[cfg(target_os = "macos")]
pub use dyld::DyldImageSource;

/// Stand-in on platforms without a dyld image list; construction fails with
/// [`Error::UnsupportedPlatform`](crate::Error::UnsupportedPlatform), which
/// makes engine initialization a startup-time failure there.
#[cfg(not(target_os = "macos"))]
pub struct DyldImageSource(());

#[cfg(not(target_os = "macos"))]
impl DyldImageSource {
    pub fn new() -> Result<Self> {
        Err(crate::Error::UnsupportedPlatform)
    }
}

#[cfg(not(target_os = "macos"))]
impl ImageSource for DyldImageSource {
    fn images(&self) -> Vec<Image> {
        Vec::new()
    }

    fn on_image_loaded(&self, _hook: ImageHook) -> Result<()> {
        Err(crate::Error::UnsupportedPlatform)
    }
}

#[cfg(target_os = "macos")]
mod dyld {
    use super::{Image, ImageHook, ImageSource};
    use crate::Result;
    use std::ffi::CStr;
    use std::sync::OnceLock;
    use tracing::trace;

    extern "C" {
        fn _dyld_image_count() -> u32;
        fn _dyld_get_image_header(image_index: u32) -> *const libc::c_void;
        fn _dyld_get_image_name(image_index: u32) -> *const libc::c_char;
        fn _dyld_register_func_for_add_image(
            func: extern "C" fn(*const libc::c_void, libc::intptr_t),
        );
    }

    static LOAD_HOOK: OnceLock<ImageHook> = OnceLock::new();

    extern "C" fn add_image_trampoline(header: *const libc::c_void, _slide: libc::intptr_t) {
        let Some(hook) = LOAD_HOOK.get() else {
            return;
        };
        if header.is_null() {
            return;
        }
        // dyld appends new images, so the current count names this one.
        let index = unsafe { _dyld_image_count() }.saturating_sub(1);
        let image = unsafe { Image::from_raw_parts(header as usize, None, index) };
        trace!("image mapped at 0x{:x}", image.header_addr());
        hook(image);
    }

    /// Image source backed by the dyld image list.
    pub struct DyldImageSource(());

    impl DyldImageSource {
        pub fn new() -> Result<Self> {
            Ok(Self(()))
        }
    }

    impl ImageSource for DyldImageSource {
        fn images(&self) -> Vec<Image> {
            let count = unsafe { _dyld_image_count() };
            let mut images = Vec::with_capacity(count as usize);
            for index in 0..count {
                let header = unsafe { _dyld_get_image_header(index) };
                if header.is_null() {
                    continue;
                }
                let name = unsafe { _dyld_get_image_name(index) };
                let path = if name.is_null() {
                    None
                } else {
                    Some(
                        unsafe { CStr::from_ptr(name) }
                            .to_string_lossy()
                            .into_owned(),
                    )
                };
                images.push(unsafe { Image::from_raw_parts(header as usize, path, index) });
            }
            images
        }

        fn on_image_loaded(&self, hook: ImageHook) -> Result<()> {
            if LOAD_HOOK.set(hook).is_ok() {
                // dyld replays the callback for every already-loaded image,
                // which reuses the same path as startup enumeration.
                unsafe { _dyld_register_func_for_add_image(add_image_trampoline) };
            }
            Ok(())
        }
    }
}
