//! Load-command parsing for in-memory Mach-O images.
//!
//! [`ParsedImage::parse`] walks one image's load commands and exposes typed
//! views over its segments, symbol table, string table, indirect symbol
//! table, and lazy/non-lazy symbol-pointer sections. Views reference the
//! image's mapped memory directly; nothing is copied out of the image except
//! dependent-library names.
//!
//! Every offset and size is validated against the region that contains it
//! before it is dereferenced. A violation fails with
//! [`Error::MalformedImage`] and aborts parsing of that single image only.

use crate::image::Image;
use crate::macho::{
    name_from_bytes, DyldInfoCommand, DylibCommand, LinkeditDataCommand, LoadCommandHeader,
    LC_DYLD_EXPORTS_TRIE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB,
    LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB,
};
use crate::{Error, Result};
use goblin::mach::constants::{
    SECTION_TYPE, SEG_LINKEDIT, SEG_TEXT, S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS,
};
use goblin::mach::header::{Header64, MH_MAGIC_64};
use goblin::mach::load_command::{
    DysymtabCommand, Section64, SegmentCommand64, SymtabCommand, LC_DYSYMTAB, LC_SEGMENT_64,
    LC_SYMTAB,
};
use goblin::mach::symbols::Nlist64;
use std::mem;
use tracing::{debug, trace};

/// Pointer-sized slot width; this crate only handles 64-bit images.
pub const SLOT_SIZE: usize = 8;

/// A named contiguous virtual-memory range within an image.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    /// Link-time virtual address, before the slide is applied.
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    /// Initial protection (VM_PROT_* bits), restored after slot rewrites.
    pub initprot: i32,
    pub maxprot: i32,
}

/// Whether a pointer section holds lazily or non-lazily bound slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Lazy,
    NonLazy,
}

/// A section holding indirect symbol pointer slots.
#[derive(Debug, Clone)]
pub struct PointerSection {
    pub name: String,
    /// Runtime address of the first slot (slide applied).
    pub base: usize,
    /// Number of pointer-sized slots.
    pub count: usize,
    /// This section's starting index into the indirect symbol table
    /// (`reserved1`).
    pub indirect_start: usize,
    pub kind: PointerKind,
    /// Index into [`ParsedImage::segments`] of the owning segment.
    pub segment: usize,
}

#[derive(Debug)]
struct SymtabView {
    symbols: usize,
    nsyms: usize,
    strings: usize,
    strsize: usize,
}

#[derive(Debug)]
struct IndirectView {
    base: usize,
    count: usize,
}

#[derive(Debug)]
struct TrieView {
    base: usize,
    size: usize,
}

/// Typed views over one parsed image. Owns no image memory; valid for as
/// long as the image stays mapped, which is the process lifetime.
#[derive(Debug)]
pub struct ParsedImage {
    header: usize,
    slide: isize,
    segments: Vec<Segment>,
    pointer_sections: Vec<PointerSection>,
    symtab: Option<SymtabView>,
    indirect: Option<IndirectView>,
    dylibs: Vec<String>,
    exports: Option<TrieView>,
}

unsafe fn read<T>(addr: usize) -> T {
    std::ptr::read_unaligned(addr as *const T)
}

fn malformed(what: &str) -> Error {
    Error::MalformedImage(what.to_string())
}

impl ParsedImage {
    /// Walk `image`'s load commands and build typed views over its metadata.
    pub fn parse(image: &Image) -> Result<Self> {
        let base = image.header_addr();
        let header: Header64 = unsafe { read(base) };
        if header.magic != MH_MAGIC_64 {
            return Err(Error::MalformedImage(format!(
                "bad magic 0x{:08x}",
                header.magic
            )));
        }

        let cmds_start = base + mem::size_of::<Header64>();
        let cmds_end = cmds_start
            .checked_add(header.sizeofcmds as usize)
            .ok_or_else(|| malformed("load command region overflows address space"))?;

        let mut segments: Vec<Segment> = Vec::new();
        let mut raw_sections: Vec<(Section64, usize)> = Vec::new();
        let mut symtab_cmd: Option<SymtabCommand> = None;
        let mut dysymtab_cmd: Option<DysymtabCommand> = None;
        let mut dylibs: Vec<String> = Vec::new();
        let mut exports_cmd: Option<(u32, u32)> = None;

        let mut cursor = cmds_start;
        for _ in 0..header.ncmds {
            if cursor + mem::size_of::<LoadCommandHeader>() > cmds_end {
                return Err(malformed("load commands overrun sizeofcmds"));
            }
            let lc: LoadCommandHeader = unsafe { read(cursor) };
            let cmdsize = lc.cmdsize as usize;
            let lc_end = cursor.checked_add(cmdsize);
            if cmdsize < mem::size_of::<LoadCommandHeader>()
                || lc_end.map_or(true, |end| end > cmds_end)
            {
                return Err(malformed("load command size out of range"));
            }

            match lc.cmd {
                LC_SEGMENT_64 => {
                    if cmdsize < mem::size_of::<SegmentCommand64>() {
                        return Err(malformed("truncated segment command"));
                    }
                    let seg: SegmentCommand64 = unsafe { read(cursor) };
                    let sections_size = (seg.nsects as usize)
                        .checked_mul(mem::size_of::<Section64>())
                        .ok_or_else(|| malformed("section count overflow"))?;
                    if cmdsize < mem::size_of::<SegmentCommand64>() + sections_size {
                        return Err(malformed("sections overrun segment command"));
                    }
                    let seg_index = segments.len();
                    for i in 0..seg.nsects as usize {
                        let sect_addr = cursor
                            + mem::size_of::<SegmentCommand64>()
                            + i * mem::size_of::<Section64>();
                        let sect: Section64 = unsafe { read(sect_addr) };
                        raw_sections.push((sect, seg_index));
                    }
                    segments.push(Segment {
                        name: name_from_bytes(&seg.segname).to_string(),
                        vmaddr: seg.vmaddr,
                        vmsize: seg.vmsize,
                        fileoff: seg.fileoff,
                        filesize: seg.filesize,
                        initprot: seg.initprot as i32,
                        maxprot: seg.maxprot as i32,
                    });
                }
                LC_SYMTAB => {
                    if cmdsize < mem::size_of::<SymtabCommand>() {
                        return Err(malformed("truncated symtab command"));
                    }
                    symtab_cmd = Some(unsafe { read(cursor) });
                }
                LC_DYSYMTAB => {
                    if cmdsize < mem::size_of::<DysymtabCommand>() {
                        return Err(malformed("truncated dysymtab command"));
                    }
                    dysymtab_cmd = Some(unsafe { read(cursor) });
                }
                LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                    if cmdsize < mem::size_of::<DylibCommand>() {
                        return Err(malformed("truncated dylib command"));
                    }
                    let dc: DylibCommand = unsafe { read(cursor) };
                    let name_off = dc.name_offset as usize;
                    if name_off >= cmdsize {
                        return Err(malformed("dylib name offset out of range"));
                    }
                    let name = unsafe {
                        cstr_bounded(cursor + name_off, cmdsize - name_off)
                    }
                    .ok_or_else(|| malformed("unterminated dylib name"))?;
                    dylibs.push(String::from_utf8_lossy(name).into_owned());
                }
                LC_DYLD_EXPORTS_TRIE => {
                    if cmdsize < mem::size_of::<LinkeditDataCommand>() {
                        return Err(malformed("truncated exports trie command"));
                    }
                    let ld: LinkeditDataCommand = unsafe { read(cursor) };
                    exports_cmd = Some((ld.dataoff, ld.datasize));
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    if cmdsize < mem::size_of::<DyldInfoCommand>() {
                        return Err(malformed("truncated dyld info command"));
                    }
                    let di: DyldInfoCommand = unsafe { read(cursor) };
                    if exports_cmd.is_none() && di.export_size > 0 {
                        exports_cmd = Some((di.export_off, di.export_size));
                    }
                }
                _ => {}
            }

            cursor += cmdsize;
        }

        // The slide is the difference between where the image landed and
        // where it was linked to land, anchored on __TEXT.
        let text = segments
            .iter()
            .find(|s| s.name == SEG_TEXT)
            .ok_or_else(|| malformed("no __TEXT segment"))?;
        let slide = (base as i64).wrapping_sub(text.vmaddr as i64) as isize;

        let mut pointer_sections = Vec::new();
        for (sect, seg_index) in &raw_sections {
            let kind = match sect.flags & SECTION_TYPE {
                S_LAZY_SYMBOL_POINTERS => PointerKind::Lazy,
                S_NON_LAZY_SYMBOL_POINTERS => PointerKind::NonLazy,
                _ => continue,
            };
            let runtime_base = (sect.addr as i64).wrapping_add(slide as i64) as usize;
            pointer_sections.push(PointerSection {
                name: name_from_bytes(&sect.sectname).to_string(),
                base: runtime_base,
                count: sect.size as usize / SLOT_SIZE,
                indirect_start: sect.reserved1 as usize,
                kind,
                segment: *seg_index,
            });
        }

        let linkedit = segments.iter().find(|s| s.name == SEG_LINKEDIT);

        let mut symtab = None;
        if let Some(st) = symtab_cmd {
            let le = linkedit.ok_or_else(|| malformed("symbol table without __LINKEDIT"))?;
            let symbols = linkedit_addr(
                le,
                slide,
                st.symoff,
                st.nsyms as u64 * mem::size_of::<Nlist64>() as u64,
            )?;
            let strings = linkedit_addr(le, slide, st.stroff, st.strsize as u64)?;
            symtab = Some(SymtabView {
                symbols,
                nsyms: st.nsyms as usize,
                strings,
                strsize: st.strsize as usize,
            });
        }

        let mut indirect = None;
        if let Some(dst) = dysymtab_cmd {
            if dst.nindirectsyms > 0 {
                let le =
                    linkedit.ok_or_else(|| malformed("indirect symbols without __LINKEDIT"))?;
                let addr = linkedit_addr(le, slide, dst.indirectsymoff, dst.nindirectsyms as u64 * 4)?;
                indirect = Some(IndirectView {
                    base: addr,
                    count: dst.nindirectsyms as usize,
                });
            }
        }

        let mut exports = None;
        if let Some((off, size)) = exports_cmd {
            if size > 0 {
                let le = linkedit.ok_or_else(|| malformed("exports trie without __LINKEDIT"))?;
                let addr = linkedit_addr(le, slide, off, size as u64)?;
                exports = Some(TrieView {
                    base: addr,
                    size: size as usize,
                });
            }
        }

        debug!(
            "parsed image at 0x{:x}: {} segments, {} pointer sections, {} syms, slide 0x{:x}",
            base,
            segments.len(),
            pointer_sections.len(),
            symtab.as_ref().map_or(0, |s| s.nsyms),
            slide,
        );
        for section in &pointer_sections {
            trace!(
                "  {:?} section {} at 0x{:x}: {} slots, indirect base {}",
                section.kind,
                section.name,
                section.base,
                section.count,
                section.indirect_start,
            );
        }

        Ok(Self {
            header: base,
            slide,
            segments,
            pointer_sections,
            symtab,
            indirect,
            dylibs,
            exports,
        })
    }

    /// Address of the image's `mach_header_64`.
    pub fn header_addr(&self) -> usize {
        self.header
    }

    /// Difference between the runtime load address and the link-time base.
    pub fn slide(&self) -> isize {
        self.slide
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn pointer_sections(&self) -> &[PointerSection] {
        &self.pointer_sections
    }

    /// Dependent library install names, in load-command (ordinal) order.
    pub fn dylibs(&self) -> &[String] {
        &self.dylibs
    }

    /// Number of symbol table entries, 0 when the image has none.
    pub fn nsyms(&self) -> usize {
        self.symtab.as_ref().map_or(0, |s| s.nsyms)
    }

    /// Read symbol table entry `index` in place.
    pub(crate) fn nlist(&self, index: usize) -> Option<Nlist64> {
        let st = self.symtab.as_ref()?;
        if index >= st.nsyms {
            return None;
        }
        Some(unsafe { read(st.symbols + index * mem::size_of::<Nlist64>()) })
    }

    /// The NUL-terminated name of `nl`, without the terminator. `None` when
    /// the string offset points outside the string table.
    pub(crate) fn symbol_name(&self, nl: &Nlist64) -> Option<&[u8]> {
        let st = self.symtab.as_ref()?;
        let strx = nl.n_strx as usize;
        if strx >= st.strsize {
            return None;
        }
        unsafe { cstr_bounded(st.strings + strx, st.strsize - strx) }
    }

    /// The indirect symbol table, empty when the image has none.
    pub(crate) fn indirect_entries(&self) -> &[u32] {
        match &self.indirect {
            Some(view) => unsafe {
                std::slice::from_raw_parts(view.base as *const u32, view.count)
            },
            None => &[],
        }
    }

    /// Raw exports trie bytes, when the image carries one.
    pub(crate) fn exports_trie(&self) -> Option<&[u8]> {
        let view = self.exports.as_ref()?;
        Some(unsafe { std::slice::from_raw_parts(view.base as *const u8, view.size) })
    }
}

/// Translate a __LINKEDIT file offset into a runtime address, verifying the
/// whole `[off, off + len)` range lies inside the segment's file extent.
fn linkedit_addr(le: &Segment, slide: isize, off: u32, len: u64) -> Result<usize> {
    let off = off as u64;
    let end = off
        .checked_add(len)
        .ok_or_else(|| malformed("linkedit range overflow"))?;
    let seg_end = le
        .fileoff
        .checked_add(le.filesize)
        .ok_or_else(|| malformed("linkedit extent overflow"))?;
    if off < le.fileoff || end > seg_end {
        return Err(malformed("linkedit data outside __LINKEDIT"));
    }
    let seg_base = le
        .vmaddr
        .checked_sub(le.fileoff)
        .ok_or_else(|| malformed("linkedit vmaddr below file offset"))?;
    Ok((seg_base.wrapping_add(off) as i64).wrapping_add(slide as i64) as usize)
}

/// Read a NUL-terminated byte string of at most `max` bytes at `addr`.
///
/// # Safety
///
/// `addr..addr + max` must be mapped readable memory.
unsafe fn cstr_bounded<'a>(addr: usize, max: usize) -> Option<&'a [u8]> {
    let bytes = std::slice::from_raw_parts(addr as *const u8, max);
    let end = bytes.iter().position(|&b| b == 0)?;
    Some(&bytes[..end])
}
