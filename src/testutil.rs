//! Synthetic in-memory Mach-O images for tests.
//!
//! [`TestImageBuilder`] assembles a minimal but structurally faithful 64-bit
//! Mach-O image inside an owned, 8-byte-aligned buffer: header, segment
//! load commands, lazy/non-lazy pointer sections, symbol/string/indirect
//! tables, and optionally dependent-dylib commands and an exports trie.
//!
//! Addresses inside the image are patched to the buffer's real allocation,
//! so the parser sees a correctly "mapped" image. A builder-configured
//! slide shifts all recorded link-time addresses down, exercising the same
//! slide arithmetic real images need.

use crate::image::Image;
use crate::macho::{LinkeditDataCommand, DylibCommand, LC_DYLD_EXPORTS_TRIE, LC_LOAD_DYLIB};
use goblin::mach::constants::{S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS};
use goblin::mach::header::{Header64, MH_EXECUTE, MH_MAGIC_64};
use goblin::mach::load_command::{
    DysymtabCommand, Section64, SegmentCommand64, SymtabCommand, LC_DYSYMTAB, LC_SEGMENT_64,
    LC_SYMTAB,
};
use goblin::mach::symbols::Nlist64;
use std::mem;

const HEADER_SIZE: usize = mem::size_of::<Header64>();
const SEG_SIZE: usize = mem::size_of::<SegmentCommand64>();
const SECT_SIZE: usize = mem::size_of::<Section64>();
const NLIST_SIZE: usize = mem::size_of::<Nlist64>();

enum SymbolKind {
    Import,
    Export { runtime_addr: usize },
}

struct Symbol {
    name: String,
    kind: SymbolKind,
}

pub struct TestImageBuilder {
    slide: usize,
    path: Option<String>,
    symbols: Vec<Symbol>,
    lazy: Vec<(usize, usize)>,    // (symbol index, initial slot value)
    nonlazy: Vec<(usize, usize)>, // (symbol index, initial slot value)
    dylibs: Vec<String>,
    trie: Option<Vec<u8>>,
}

impl TestImageBuilder {
    pub fn new() -> Self {
        Self {
            slide: 0,
            path: None,
            symbols: Vec::new(),
            lazy: Vec::new(),
            nonlazy: Vec::new(),
            dylibs: Vec::new(),
            trie: None,
        }
    }

    /// Pretend the image was linked `slide` bytes below where it "loaded".
    pub fn slide(mut self, slide: usize) -> Self {
        self.slide = slide;
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Add an undefined symbol bound through a lazy pointer slot holding
    /// `initial`.
    pub fn lazy_import(mut self, name: &str, initial: usize) -> Self {
        let index = self.push_symbol(name, SymbolKind::Import);
        self.lazy.push((index, initial));
        self
    }

    /// Add an undefined symbol bound through a non-lazy pointer slot.
    pub fn nonlazy_import(mut self, name: &str, initial: usize) -> Self {
        let index = self.push_symbol(name, SymbolKind::Import);
        self.nonlazy.push((index, initial));
        self
    }

    /// Add a defined, exported symbol whose runtime address is
    /// `runtime_addr`.
    pub fn exported(mut self, name: &str, runtime_addr: usize) -> Self {
        self.push_symbol(name, SymbolKind::Export { runtime_addr });
        self
    }

    /// Add an LC_LOAD_DYLIB command (ordinals follow call order).
    pub fn dylib(mut self, install_name: &str) -> Self {
        self.dylibs.push(install_name.to_string());
        self
    }

    /// Attach raw exports-trie bytes via LC_DYLD_EXPORTS_TRIE.
    pub fn exports_trie(mut self, trie: Vec<u8>) -> Self {
        self.trie = Some(trie);
        self
    }

    fn push_symbol(&mut self, name: &str, kind: SymbolKind) -> usize {
        self.symbols.push(Symbol {
            name: name.to_string(),
            kind,
        });
        self.symbols.len() - 1
    }

    pub fn build(self) -> TestImage {
        let nslots = self.lazy.len() + self.nonlazy.len();
        let nsects = usize::from(!self.lazy.is_empty()) + usize::from(!self.nonlazy.is_empty());
        let has_data = nslots > 0;
        let has_symtab = !self.symbols.is_empty();
        let trie_len = self.trie.as_ref().map_or(0, |t| t.len());

        // Load command sizes, in emission order.
        let dylib_sizes: Vec<usize> = self
            .dylibs
            .iter()
            .map(|name| align8(mem::size_of::<DylibCommand>() + name.len() + 1))
            .collect();
        let mut cmds_size = SEG_SIZE; // __TEXT
        if has_data {
            cmds_size += SEG_SIZE + nsects * SECT_SIZE;
        }
        cmds_size += SEG_SIZE; // __LINKEDIT
        cmds_size += dylib_sizes.iter().sum::<usize>();
        if has_symtab {
            cmds_size += mem::size_of::<SymtabCommand>();
        }
        if has_data {
            cmds_size += mem::size_of::<DysymtabCommand>();
        }
        if trie_len > 0 {
            cmds_size += mem::size_of::<LinkeditDataCommand>();
        }
        let mut ncmds = 2 + self.dylibs.len(); // __TEXT + __LINKEDIT + dylibs
        ncmds += usize::from(has_data) * 2; // __DATA + LC_DYSYMTAB
        ncmds += usize::from(has_symtab);
        ncmds += usize::from(trie_len > 0);

        // Region offsets within the buffer.
        let data_off = align8(HEADER_SIZE + cmds_size);
        let lazy_off = data_off;
        let nonlazy_off = lazy_off + 8 * self.lazy.len();
        let data_len = 8 * nslots;

        let le_off = align8(data_off + data_len);
        let indirect_off = le_off;
        let nlist_off = align8(indirect_off + 4 * nslots);
        let str_off = nlist_off + NLIST_SIZE * self.symbols.len();
        let strings: Vec<u8> = {
            let mut bytes = vec![0u8];
            for sym in &self.symbols {
                bytes.push(b'_');
                bytes.extend_from_slice(sym.name.as_bytes());
                bytes.push(0);
            }
            bytes
        };
        let trie_off = str_off + strings.len();
        let total = trie_off + trie_len;
        let le_len = total - le_off;

        let mut buf = vec![0u64; (total + 7) / 8];
        let base = buf.as_mut_ptr() as usize;
        let slide = self.slide;
        let unslid = |runtime: usize| (runtime.wrapping_sub(slide)) as u64;

        let mut symtab_cmd_addr = 0usize;
        let mut off = 0usize;

        put(
            base,
            &mut off,
            Header64 {
                magic: MH_MAGIC_64,
                cputype: 0x0100_0007, // x86_64; the parser never branches on it
                cpusubtype: 3,
                filetype: MH_EXECUTE,
                ncmds: ncmds as u32,
                sizeofcmds: cmds_size as u32,
                flags: 0,
                reserved: 0,
            },
        );

        put(
            base,
            &mut off,
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmdsize: SEG_SIZE as u32,
                segname: seg_name(b"__TEXT"),
                vmaddr: unslid(base),
                vmsize: data_off as u64,
                fileoff: 0,
                filesize: data_off as u64,
                maxprot: 5,
                initprot: 5,
                nsects: 0,
                flags: 0,
            },
        );

        if has_data {
            put(
                base,
                &mut off,
                SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: (SEG_SIZE + nsects * SECT_SIZE) as u32,
                    segname: seg_name(b"__DATA"),
                    vmaddr: unslid(base + data_off),
                    vmsize: data_len as u64,
                    fileoff: data_off as u64,
                    filesize: data_len as u64,
                    maxprot: 3,
                    initprot: 3,
                    nsects: nsects as u32,
                    flags: 0,
                },
            );
            if !self.lazy.is_empty() {
                put(
                    base,
                    &mut off,
                    Section64 {
                        sectname: seg_name(b"__la_symbol_ptr"),
                        segname: seg_name(b"__DATA"),
                        addr: unslid(base + lazy_off),
                        size: (8 * self.lazy.len()) as u64,
                        offset: lazy_off as u32,
                        align: 3,
                        reloff: 0,
                        nreloc: 0,
                        flags: S_LAZY_SYMBOL_POINTERS,
                        reserved1: 0,
                        reserved2: 0,
                        reserved3: 0,
                    },
                );
            }
            if !self.nonlazy.is_empty() {
                put(
                    base,
                    &mut off,
                    Section64 {
                        sectname: seg_name(b"__nl_symbol_ptr"),
                        segname: seg_name(b"__DATA"),
                        addr: unslid(base + nonlazy_off),
                        size: (8 * self.nonlazy.len()) as u64,
                        offset: nonlazy_off as u32,
                        align: 3,
                        reloff: 0,
                        nreloc: 0,
                        flags: S_NON_LAZY_SYMBOL_POINTERS,
                        reserved1: self.lazy.len() as u32,
                        reserved2: 0,
                        reserved3: 0,
                    },
                );
            }
        }

        put(
            base,
            &mut off,
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmdsize: SEG_SIZE as u32,
                segname: seg_name(b"__LINKEDIT"),
                vmaddr: unslid(base + le_off),
                vmsize: le_len as u64,
                fileoff: le_off as u64,
                filesize: le_len as u64,
                maxprot: 1,
                initprot: 1,
                nsects: 0,
                flags: 0,
            },
        );

        for (name, cmdsize) in self.dylibs.iter().zip(&dylib_sizes) {
            let cmd_start = off;
            put(
                base,
                &mut off,
                DylibCommand {
                    cmd: LC_LOAD_DYLIB,
                    cmdsize: *cmdsize as u32,
                    name_offset: mem::size_of::<DylibCommand>() as u32,
                    timestamp: 2,
                    current_version: 0,
                    compatibility_version: 0,
                },
            );
            put_bytes(base, &mut off, name.as_bytes());
            put_bytes(base, &mut off, &[0]);
            off = cmd_start + cmdsize;
        }

        if has_symtab {
            symtab_cmd_addr = base + off;
            put(
                base,
                &mut off,
                SymtabCommand {
                    cmd: LC_SYMTAB,
                    cmdsize: mem::size_of::<SymtabCommand>() as u32,
                    symoff: nlist_off as u32,
                    nsyms: self.symbols.len() as u32,
                    stroff: str_off as u32,
                    strsize: strings.len() as u32,
                },
            );
        }

        if has_data {
            put(
                base,
                &mut off,
                DysymtabCommand {
                    cmd: LC_DYSYMTAB,
                    cmdsize: mem::size_of::<DysymtabCommand>() as u32,
                    ilocalsym: 0,
                    nlocalsym: 0,
                    iextdefsym: 0,
                    nextdefsym: 0,
                    iundefsym: 0,
                    nundefsym: self.symbols.len() as u32,
                    tocoff: 0,
                    ntoc: 0,
                    modtaboff: 0,
                    nmodtab: 0,
                    extrefsymoff: 0,
                    nextrefsyms: 0,
                    indirectsymoff: indirect_off as u32,
                    nindirectsyms: nslots as u32,
                    extreloff: 0,
                    nextrel: 0,
                    locreloff: 0,
                    nlocrel: 0,
                },
            );
        }

        if let Some(trie) = &self.trie {
            put(
                base,
                &mut off,
                LinkeditDataCommand {
                    cmd: LC_DYLD_EXPORTS_TRIE,
                    cmdsize: mem::size_of::<LinkeditDataCommand>() as u32,
                    dataoff: trie_off as u32,
                    datasize: trie.len() as u32,
                },
            );
        }

        // Slot contents.
        let mut slot = lazy_off;
        for (_, initial) in self.lazy.iter().chain(&self.nonlazy) {
            let mut at = slot;
            put(base, &mut at, *initial);
            slot += 8;
        }

        // Indirect table: lazy entries then non-lazy entries.
        let mut at = indirect_off;
        for (sym_index, _) in self.lazy.iter().chain(&self.nonlazy) {
            put(base, &mut at, *sym_index as u32);
        }

        // Symbol and string tables.
        let mut strx = 1u32;
        let mut at = nlist_off;
        for sym in &self.symbols {
            let nlist = match sym.kind {
                SymbolKind::Import => Nlist64 {
                    n_strx: strx,
                    n_type: 0x01, // N_UNDF | N_EXT
                    n_sect: 0,
                    n_desc: 0,
                    n_value: 0,
                },
                SymbolKind::Export { runtime_addr } => Nlist64 {
                    n_strx: strx,
                    n_type: 0x0f, // N_SECT | N_EXT
                    n_sect: 1,
                    n_desc: 0,
                    n_value: unslid(runtime_addr),
                },
            };
            put(base, &mut at, nlist);
            strx += sym.name.len() as u32 + 2;
        }
        let mut at = str_off;
        put_bytes(base, &mut at, &strings);

        if let Some(trie) = &self.trie {
            let mut at = trie_off;
            put_bytes(base, &mut at, trie);
        }

        TestImage {
            _buf: buf,
            base,
            path: self.path,
            slots_off: lazy_off,
            indirect_off,
            symtab_cmd_addr,
        }
    }
}

/// A built synthetic image. The buffer stays allocated (and its address
/// stable) for the life of this value.
pub struct TestImage {
    _buf: Vec<u64>,
    base: usize,
    path: Option<String>,
    slots_off: usize,
    indirect_off: usize,
    symtab_cmd_addr: usize,
}

impl TestImage {
    pub fn image(&self) -> Image {
        unsafe { Image::from_raw_parts(self.base, self.path.clone(), 0) }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Runtime address of pointer slot `i` (lazy slots first, then
    /// non-lazy, in builder call order).
    pub fn slot_addr(&self, i: usize) -> usize {
        self.base + self.slots_off + 8 * i
    }

    pub fn slot_value(&self, i: usize) -> usize {
        unsafe { (self.slot_addr(i) as *const usize).read_volatile() }
    }

    pub fn set_indirect_entry(&self, i: usize, value: u32) {
        unsafe { ((self.base + self.indirect_off + 4 * i) as *mut u32).write(value) };
    }

    /// Address of the LC_SYMTAB command, for corruption tests.
    pub fn symtab_cmd_addr(&self) -> usize {
        self.symtab_cmd_addr
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn seg_name(name: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name);
    out
}

fn put<T>(base: usize, off: &mut usize, value: T) {
    unsafe { std::ptr::write_unaligned((base + *off) as *mut T, value) };
    *off += mem::size_of::<T>();
}

fn put_bytes(base: usize, off: &mut usize, bytes: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), (base + *off) as *mut u8, bytes.len())
    };
    *off += bytes.len();
}
