//! Symbol address resolution from an image's own metadata.
//!
//! Looks a symbol up the way the dynamic linker would: first a linear scan
//! of the symbol table, then a walk of the exports trie. Re-exported
//! symbols are chased into the dependent library they name, resolved by
//! load-command ordinal.
//!
//! Addresses returned here are runtime addresses with the image's slide
//! already applied.

use crate::image::{find_image, Image, ImageSource};
use crate::index::names_match;
use crate::macho::{
    EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE, EXPORT_SYMBOL_FLAGS_KIND_MASK,
    EXPORT_SYMBOL_FLAGS_KIND_REGULAR, EXPORT_SYMBOL_FLAGS_REEXPORT,
    EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER, EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION, N_STAB,
};
use crate::parser::ParsedImage;
use tracing::{debug, trace, warn};

/// Re-export chains longer than this are treated as cycles and abandoned.
const MAX_REEXPORT_DEPTH: usize = 8;

/// Resolve `symbol` to a runtime address within `image`, chasing
/// re-exports through `source` when the exports trie delegates to a
/// dependent library. `None` when the image does not define the symbol.
pub fn resolve_symbol<S: ImageSource>(source: &S, image: &Image, symbol: &str) -> Option<usize> {
    resolve_at_depth(source, image, symbol, 0)
}

/// Resolve `symbol` in the loaded image named `image_name` (full path or
/// trailing path component).
pub fn resolve_named<S: ImageSource>(
    source: &S,
    image_name: &str,
    symbol: &str,
) -> Option<usize> {
    let image = find_image(source, image_name)?;
    resolve_symbol(source, &image, symbol)
}

fn resolve_at_depth<S: ImageSource>(
    source: &S,
    image: &Image,
    symbol: &str,
    depth: usize,
) -> Option<usize> {
    if depth > MAX_REEXPORT_DEPTH {
        warn!("re-export chain for '{}' too deep, giving up", symbol);
        return None;
    }
    let parsed = match ParsedImage::parse(image) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                "cannot resolve '{}': image at 0x{:x} failed to parse: {}",
                symbol,
                image.header_addr(),
                err
            );
            return None;
        }
    };

    if let Some(addr) = resolve_local(&parsed, symbol) {
        return Some(addr);
    }
    resolve_exported(source, &parsed, symbol, depth)
}

/// Linear scan of the symbol table, the common fast path for symbols the
/// image defines itself.
fn resolve_local(parsed: &ParsedImage, symbol: &str) -> Option<usize> {
    for i in 0..parsed.nsyms() {
        let nl = parsed.nlist(i)?;
        if nl.n_strx == 0 {
            continue;
        }
        let Some(name) = parsed.symbol_name(&nl) else {
            continue;
        };
        if names_match(name, symbol) && nl.n_value > 0 {
            let addr = (nl.n_value as i64).wrapping_add(parsed.slide() as i64) as usize;
            trace!("'{}' found in symbol table at 0x{:x}", symbol, addr);
            return Some(addr);
        }
    }
    None
}

fn resolve_exported<S: ImageSource>(
    source: &S,
    parsed: &ParsedImage,
    symbol: &str,
    depth: usize,
) -> Option<usize> {
    let trie = parsed.exports_trie()?;

    // Trie entries carry the platform mangling; try the mangled spelling
    // first, then the name as given.
    let mangled = format!("_{}", symbol);
    let terminal = walk_export_trie(trie, &mangled)
        .or_else(|| walk_export_trie(trie, symbol))?;

    let (flags, consumed) = read_uleb128(terminal, 0).ok()?;
    let mut pos = consumed;

    if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
        let (ordinal, consumed) = read_uleb128(terminal, pos).ok()?;
        pos += consumed;
        let imported = cstr_at(terminal, pos)?;
        let target: &str = if imported.is_empty() {
            symbol
        } else {
            std::str::from_utf8(imported.strip_prefix(b"_").unwrap_or(imported)).ok()?
        };
        let ordinal = ordinal as usize;
        if ordinal == 0 {
            return None;
        }
        let dylib = parsed.dylibs().get(ordinal - 1)?;
        debug!(
            "'{}' is re-exported from {} as '{}'",
            symbol, dylib, target
        );
        let dependent = find_image(source, dylib)
            .or_else(|| find_image(source, dylib.rsplit('/').next().unwrap_or(dylib)))?;
        return resolve_at_depth(source, &dependent, target, depth + 1);
    }

    match flags & EXPORT_SYMBOL_FLAGS_KIND_MASK {
        EXPORT_SYMBOL_FLAGS_KIND_REGULAR | EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION => {
            if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                // Use the stub address; invoking the resolver is not an
                // option while another thread may hold the registry lock.
                let (stub_offset, _) = read_uleb128(terminal, pos).ok()?;
                return Some(parsed.header_addr().wrapping_add(stub_offset as usize));
            }
            let (offset, _) = read_uleb128(terminal, pos).ok()?;
            Some(parsed.header_addr().wrapping_add(offset as usize))
        }
        EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => {
            let (value, _) = read_uleb128(terminal, pos).ok()?;
            Some(value as usize)
        }
        _ => None,
    }
}

/// Walk the exports trie edge by edge, consuming `symbol` as the path, and
/// return the terminal payload of the node it lands on.
fn walk_export_trie<'a>(trie: &'a [u8], symbol: &str) -> Option<&'a [u8]> {
    let mut remaining = symbol.as_bytes();
    let mut pos = 0usize;

    loop {
        let (terminal_size, consumed) = read_uleb128(trie, pos).ok()?;
        let payload = pos + consumed;

        if remaining.is_empty() {
            return if terminal_size > 0 {
                trie.get(payload..payload + terminal_size as usize)
            } else {
                None
            };
        }

        let children = payload.checked_add(terminal_size as usize)?;
        let child_count = *trie.get(children)? as usize;
        let mut p = children + 1;

        let mut next = None;
        for _ in 0..child_count {
            let label = cstr_at(trie, p)?;
            p += label.len() + 1;
            let (node_offset, consumed) = read_uleb128(trie, p).ok()?;
            p += consumed;
            if next.is_none() && remaining.starts_with(label) && !label.is_empty() {
                next = Some((node_offset as usize, label.len()));
            }
        }

        let (node_offset, label_len) = next?;
        if node_offset == 0 || node_offset >= trie.len() {
            return None;
        }
        remaining = &remaining[label_len..];
        pos = node_offset;
    }
}

/// Iterate every symbol the image defines: the non-debug symbol table
/// entries, then the exports trie. Stops early when `f` returns `true`.
pub fn for_each_symbol(parsed: &ParsedImage, mut f: impl FnMut(&[u8], usize) -> bool) {
    for i in 0..parsed.nsyms() {
        let Some(nl) = parsed.nlist(i) else {
            break;
        };
        if nl.n_type & N_STAB != 0 || nl.n_sect == 0 {
            continue;
        }
        let Some(name) = parsed.symbol_name(&nl) else {
            continue;
        };
        let addr = (nl.n_value as i64).wrapping_add(parsed.slide() as i64) as usize;
        if f(name, addr) {
            return;
        }
    }

    let Some(trie) = parsed.exports_trie() else {
        return;
    };
    for_each_in_trie(parsed, trie, &mut f);
}

/// Preorder traversal of the exports trie, accumulating symbol names edge
/// by edge.
fn for_each_in_trie(
    parsed: &ParsedImage,
    trie: &[u8],
    f: &mut impl FnMut(&[u8], usize) -> bool,
) {
    const MAX_NODES: usize = 100_000;

    let mut stack: Vec<(usize, Vec<u8>)> = vec![(0, Vec::new())];
    let mut visited = 0usize;

    while let Some((pos, prefix)) = stack.pop() {
        visited += 1;
        if visited > MAX_NODES {
            warn!("exports trie too large, stopping enumeration");
            return;
        }

        let Ok((terminal_size, consumed)) = read_uleb128(trie, pos) else {
            continue;
        };
        let payload = pos + consumed;

        if terminal_size > 0 {
            let Some(terminal) = trie.get(payload..payload + terminal_size as usize) else {
                continue;
            };
            if let Some(addr) = terminal_address(parsed, terminal) {
                if f(&prefix, addr) {
                    return;
                }
            }
        }

        let Some(children) = payload.checked_add(terminal_size as usize) else {
            continue;
        };
        let Some(&child_count) = trie.get(children) else {
            continue;
        };
        let mut p = children + 1;
        for _ in 0..child_count {
            let Some(label) = cstr_at(trie, p) else {
                break;
            };
            p += label.len() + 1;
            let Ok((node_offset, consumed)) = read_uleb128(trie, p) else {
                break;
            };
            p += consumed;
            if node_offset == 0 || node_offset as usize >= trie.len() {
                continue;
            }
            let mut child_prefix = prefix.clone();
            child_prefix.extend_from_slice(label);
            stack.push((node_offset as usize, child_prefix));
        }
    }
}

/// Decode a terminal payload into a runtime address. Re-exports have no
/// address in this image and yield `None`.
fn terminal_address(parsed: &ParsedImage, terminal: &[u8]) -> Option<usize> {
    let (flags, consumed) = read_uleb128(terminal, 0).ok()?;
    if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
        return None;
    }
    match flags & EXPORT_SYMBOL_FLAGS_KIND_MASK {
        EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => {
            let (value, _) = read_uleb128(terminal, consumed).ok()?;
            Some(value as usize)
        }
        _ => {
            let (offset, _) = read_uleb128(terminal, consumed).ok()?;
            Some(parsed.header_addr().wrapping_add(offset as usize))
        }
    }
}

fn cstr_at(data: &[u8], pos: usize) -> Option<&[u8]> {
    let rest = data.get(pos..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    Some(&rest[..end])
}

/// Read a ULEB128 encoded unsigned integer, returns (value, bytes_consumed)
fn read_uleb128(data: &[u8], start_index: usize) -> Result<(u64, usize), &'static str> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut bytes_consumed = 0;

    while start_index + bytes_consumed < data.len() {
        let byte = data[start_index + bytes_consumed];
        bytes_consumed += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_consumed));
        }

        shift += 7;
        if shift >= 64 {
            return Err("ULEB128 value too large");
        }
    }

    Err("unexpected end of data while reading ULEB128")
}
