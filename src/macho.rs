//! Mach-O binary format structures and constants.
//!
//! Structures and constants used for parsing Mach-O images in memory that
//! goblin does not expose. The segment, section, and symbol-table layouts
//! themselves come from `goblin::mach`; this module carries the remaining
//! load-command headers and the indirect-symbol and export-trie constants.

// Load command types
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;

// Special values in the indirect symbol table. Slots carrying these do not
// reference a symbol-table entry and are never rebound.
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x80000000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x40000000;

// nlist n_type fields
pub const N_STAB: u8 = 0xe0;
pub const N_TYPE: u8 = 0x0e;
pub const N_EXT: u8 = 0x01;
pub const N_UNDF: u8 = 0x0;
pub const N_SECT: u8 = 0xe;

// Export symbol flags from Apple's MachOTrie.hpp
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// Generic load command header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmdsize: u32,
}

/// LinkEdit data command (LC_DYLD_EXPORTS_TRIE, LC_FUNCTION_STARTS, etc.)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

/// Dynamic linker info command (LC_DYLD_INFO, LC_DYLD_INFO_ONLY)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// Dynamic library load command (LC_LOAD_DYLIB and friends)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DylibCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// Decode a fixed-width, NUL-padded segment or section name.
pub fn name_from_bytes(raw: &[u8; 16]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}
