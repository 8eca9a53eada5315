//! Export-trie reader.
//!
//! The trie stores symbol names on its edges; a node with a terminal
//! payload describes one export. Three kinds exist: regular exports
//! (address), reexports (dylib ordinal + optional renamed import), and
//! stub-and-resolver exports (stub address + resolver address).

use crate::error::{ExtractError, Result};
use crate::leb128::decode_uleb128;
use crate::macho::constants::{
    EXPORT_SYMBOL_FLAGS_REEXPORT, EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER,
};

#[derive(Debug, Clone, Default)]
pub struct ExportInfo {
    pub address: u64,
    pub flags: u64,
    /// Dylib ordinal for reexports, resolver address for
    /// stub-and-resolver exports.
    pub other: u64,
    /// Symbol name, NUL terminated.
    pub name: Vec<u8>,
    /// For reexports, the name in the source dylib when it differs.
    pub import_name: Option<Vec<u8>>,
}

/// Reads every export out of the trie blob at
/// `data[export_off..export_off + export_size]`.
pub fn read_exports(data: &[u8], export_off: usize, export_size: usize) -> Result<Vec<ExportInfo>> {
    let mut reader = TrieReader {
        data,
        start: export_off,
        end: export_off + export_size,
        exports: Vec::new(),
    };

    let mut prefix = Vec::new();
    reader.process_node(export_off, &mut prefix)?;
    Ok(reader.exports)
}

struct TrieReader<'a> {
    data: &'a [u8],
    start: usize,
    end: usize,
    exports: Vec<ExportInfo>,
}

impl TrieReader<'_> {
    fn process_node(&mut self, offset: usize, prefix: &mut Vec<u8>) -> Result<()> {
        if offset >= self.end {
            return Err(ExtractError::ContainerParse(
                "trie node offset extends beyond export end".into(),
            ));
        }

        let (terminal_size, offset) = decode_uleb128(self.data, offset)?;
        let mut children_off = offset + terminal_size as usize;
        if children_off >= self.end {
            return Err(ExtractError::ContainerParse(
                "trie children offset extends beyond export end".into(),
            ));
        }

        if terminal_size != 0 {
            let mut name = prefix.clone();
            name.push(0);
            self.exports.push(read_terminal(self.data, offset, name)?);
        }

        let children_count = self.data[children_off];
        children_off += 1;

        for _ in 0..children_count {
            let (edge, next) = read_cstring(self.data, children_off)?;
            children_off = next;

            let (child_node_off, next) = decode_uleb128(self.data, children_off)?;
            children_off = next;

            let saved_len = prefix.len();
            prefix.extend_from_slice(&edge);
            self.process_node(self.start + child_node_off as usize, prefix)?;
            prefix.truncate(saved_len);
        }

        Ok(())
    }
}

fn read_terminal(data: &[u8], offset: usize, name: Vec<u8>) -> Result<ExportInfo> {
    let mut export = ExportInfo {
        name,
        ..Default::default()
    };

    let (flags, mut offset) = decode_uleb128(data, offset)?;
    export.flags = flags;

    if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
        let (ordinal, next) = decode_uleb128(data, offset)?;
        export.other = ordinal;

        let (import_name, _) = read_cstring(data, next)?;
        if !import_name.is_empty() {
            let mut import_name = import_name;
            import_name.push(0);
            export.import_name = Some(import_name);
        }
    } else {
        let (address, next) = decode_uleb128(data, offset)?;
        export.address = address;
        offset = next;

        if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            let (resolver, _) = decode_uleb128(data, offset)?;
            export.other = resolver;
        }
    }

    Ok(export)
}

/// Reads a NUL-terminated string without the NUL, returning the offset
/// past the terminator.
fn read_cstring(data: &[u8], offset: usize) -> Result<(Vec<u8>, usize)> {
    let end = data[offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ExtractError::ContainerParse("unterminated trie string".into()))?;
    Ok((data[offset..offset + end].to_vec(), offset + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leb128::encode_uleb128;

    // Hand-assembled trie:
    //   root -> "_a" (regular, addr 0x1000)
    //        -> "_b" (reexport of "_c" from ordinal 2)
    fn sample_trie() -> Vec<u8> {
        let mut trie = vec![
            0x00, // root: no terminal
            0x02, // two children
        ];
        trie.extend_from_slice(b"_a\0");
        let a_fixup = trie.len();
        trie.push(0); // child offset patched below
        trie.extend_from_slice(b"_b\0");
        let b_fixup = trie.len();
        trie.push(0);

        trie[a_fixup] = trie.len() as u8;
        // _a terminal: flags=regular, address
        let mut payload = encode_uleb128(0);
        payload.extend(encode_uleb128(0x1000));
        trie.push(payload.len() as u8);
        trie.extend(payload);
        trie.push(0); // no children

        trie[b_fixup] = trie.len() as u8;
        // _b terminal: flags=reexport, ordinal 2, import name "_c"
        let mut payload = encode_uleb128(EXPORT_SYMBOL_FLAGS_REEXPORT);
        payload.extend(encode_uleb128(2));
        payload.extend_from_slice(b"_c\0");
        trie.push(payload.len() as u8);
        trie.extend(payload);
        trie.push(0); // no children

        trie
    }

    #[test]
    fn parses_regular_and_reexport_entries() {
        let trie = sample_trie();
        let exports = read_exports(&trie, 0, trie.len()).unwrap();
        assert_eq!(exports.len(), 2);

        let a = exports.iter().find(|e| e.name == b"_a\0").unwrap();
        assert_eq!(a.address, 0x1000);
        assert_eq!(a.flags, 0);

        let b = exports.iter().find(|e| e.name == b"_b\0").unwrap();
        assert_eq!(b.flags, EXPORT_SYMBOL_FLAGS_REEXPORT);
        assert_eq!(b.other, 2);
        assert_eq!(b.import_name.as_deref(), Some(&b"_c\0"[..]));
    }

    #[test]
    fn rejects_out_of_bounds_nodes() {
        let trie = sample_trie();
        assert!(read_exports(&trie, 0, 2).is_err());
    }
}
