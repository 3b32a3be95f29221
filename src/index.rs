//! Resolution of symbol names to indirect pointer-slot addresses.
//!
//! For every lazy/non-lazy pointer section of a parsed image, slot `i`
//! corresponds to indirect-symbol-table entry `reserved1 + i`, which names a
//! symbol table entry, which names a string. [`resolve_slots`] walks that
//! chain and collects the runtime addresses of all slots bound to a given
//! symbol name.

use crate::macho::{INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL};
use crate::parser::{ParsedImage, SLOT_SIZE};
use tracing::{trace, warn};

/// One rewritable pointer slot, paired with the protection to restore on its
/// owning segment's pages after a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub address: usize,
    pub restore_prot: i32,
}

/// Compare a symbol-table name against a caller-supplied one.
///
/// C symbols carry a leading underscore in Mach-O symbol tables; callers
/// pass the source-level name. The underscore is stripped from the table
/// side so the comparison is consistent everywhere in this crate.
pub(crate) fn names_match(table_name: &[u8], query: &str) -> bool {
    let stripped = table_name.strip_prefix(b"_").unwrap_or(table_name);
    stripped == query.as_bytes()
}

/// Every pointer-slot address in `parsed` whose indirect entry resolves to
/// `symbol`. Absence is expected and returns an empty vector, silently.
pub fn resolve_slots(parsed: &ParsedImage, symbol: &str) -> Vec<Slot> {
    let indirect = parsed.indirect_entries();
    if indirect.is_empty() || parsed.nsyms() == 0 {
        return Vec::new();
    }

    let mut slots = Vec::new();
    for section in parsed.pointer_sections() {
        let restore_prot = match parsed.segments().get(section.segment) {
            Some(seg) => seg.initprot,
            None => continue,
        };
        for i in 0..section.count {
            let entry = match indirect.get(section.indirect_start + i) {
                Some(&entry) => entry,
                None => {
                    warn!(
                        "section {} slot {} has no indirect entry, skipping rest",
                        section.name, i
                    );
                    break;
                }
            };
            // ABS and LOCAL entries carry no symbol reference.
            if entry & (INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL) != 0 {
                continue;
            }
            let Some(nl) = parsed.nlist(entry as usize) else {
                continue;
            };
            let Some(name) = parsed.symbol_name(&nl) else {
                continue;
            };
            if names_match(name, symbol) {
                let address = section.base + i * SLOT_SIZE;
                trace!(
                    "resolved '{}' to slot 0x{:x} ({} [{}])",
                    symbol,
                    address,
                    section.name,
                    i
                );
                slots.push(Slot {
                    address,
                    restore_prot,
                });
            }
        }
    }
    slots
}
