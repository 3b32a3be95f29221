//! Atomic rewriting of pointer slots behind a scoped protection toggle.
//!
//! Pointer-slot sections may live on read-only pages (`__DATA_CONST`). A
//! rewrite makes the containing page span writable, performs exactly one
//! atomic pointer-sized swap, and restores the section's original protection
//! before returning. Restoration happens on every exit path; the writable
//! window is never held across unrelated work.

use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{trace, warn};

fn page_size() -> usize {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        // POSIX guarantees a power-of-two page size; 4 KiB covers the
        // unlikely sysconf failure without changing span math.
        return 4096;
    }
    value as usize
}

fn protect_span(address: usize, len: usize) -> (usize, usize) {
    let page = page_size();
    let start = address & !(page - 1);
    let end_inclusive = address + len - 1;
    let end_page = end_inclusive & !(page - 1);
    (start, end_page + page - start)
}

/// Makes a page span writable on construction and restores the original
/// protection when dropped.
struct ProtectGuard {
    start: usize,
    len: usize,
    restore_prot: i32,
}

#[cfg(target_os = "macos")]
fn set_protection(start: usize, len: usize, prot: i32) -> std::result::Result<(), i32> {
    use mach2::traps::mach_task_self;
    use mach2::vm::mach_vm_protect;

    let kr = unsafe { mach_vm_protect(mach_task_self(), start as u64, len as u64, 0, prot) };
    if kr == mach2::kern_return::KERN_SUCCESS {
        Ok(())
    } else {
        Err(kr)
    }
}

#[cfg(not(target_os = "macos"))]
fn set_protection(start: usize, len: usize, prot: i32) -> std::result::Result<(), i32> {
    let rc = unsafe { libc::mprotect(start as *mut libc::c_void, len, prot) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1))
    }
}

#[cfg(target_os = "macos")]
fn writable_prot() -> i32 {
    use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_READ, VM_PROT_WRITE};
    // VM_PROT_COPY forces copy-on-write on pages whose maximum protection
    // forbids plain writes, matching how dyld itself patches __DATA_CONST.
    VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY
}

#[cfg(not(target_os = "macos"))]
fn writable_prot() -> i32 {
    libc::PROT_READ | libc::PROT_WRITE
}

impl ProtectGuard {
    fn make_writable(address: usize, len: usize, restore_prot: i32) -> Result<Self> {
        let (start, span) = protect_span(address, len);
        set_protection(start, span, writable_prot())
            .map_err(|code| Error::ProtectionDenied { code })?;
        Ok(Self {
            start,
            len: span,
            restore_prot,
        })
    }
}

impl Drop for ProtectGuard {
    fn drop(&mut self) {
        if let Err(code) = set_protection(self.start, self.len, self.restore_prot) {
            warn!(
                "failed to restore protection {:#x} on 0x{:x}..0x{:x} (code {})",
                self.restore_prot,
                self.start,
                self.start + self.len,
                code
            );
        }
    }
}

/// Atomically replace the pointer stored at `address` with `new_value`,
/// returning the previous value.
///
/// The page span containing the slot is made writable for the duration of
/// the single store and restored to `restore_prot` (the owning section's
/// original protection) afterwards. If the protection change is denied, no
/// write is performed.
///
/// # Safety
///
/// `address` must be a pointer-aligned slot inside a pointer-slot section of
/// a currently mapped image, as identified by the parser. Rewriting
/// arbitrary addresses is undefined behavior.
pub unsafe fn rewrite_slot(address: usize, new_value: usize, restore_prot: i32) -> Result<usize> {
    if address == 0 || address % std::mem::size_of::<usize>() != 0 {
        return Err(Error::MalformedImage(format!(
            "misaligned pointer slot 0x{:x}",
            address
        )));
    }

    let guard = ProtectGuard::make_writable(address, std::mem::size_of::<usize>(), restore_prot)?;
    let slot = AtomicUsize::from_ptr(address as *mut usize);
    let previous = slot.swap(new_value, Ordering::SeqCst);
    drop(guard);

    trace!(
        "slot 0x{:x}: 0x{:x} -> 0x{:x}",
        address,
        previous,
        new_value
    );
    Ok(previous)
}
