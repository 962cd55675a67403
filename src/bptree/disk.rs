//! B+-tree node persistence and per-segment root records.
//!
//! At rotation the active tree is written to `BPT-<fid>` with children
//! serialized before their parents, so node addresses are known when a
//! parent is encoded and the root lands at the highest offset. A small
//! `BPTRoot-<fid>` record stores the root address together with the
//! segment's key range. Committed-TxID trees use the same node format in
//! `BPTTxID-<fid>` / `BPTRootTxID-<fid>`.

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{BPTree, Node};
use crate::errdata;
use crate::error::Result;

const LEAF_TAG: u8 = 1;
const INTERNAL_TAG: u8 = 0;

impl BPTree {
    /// Persists every node to `path` and returns the root's file offset.
    pub fn write_nodes(&mut self, path: &Path, sync: bool) -> Result<u64> {
        let mut buf = Vec::new();
        let root_off = self.encode_node(self.root, &mut buf)?;

        let mut file = File::create(path)?;
        file.write_all(&buf)?;
        if sync {
            file.sync_all()?;
        }

        self.set_root_address(root_off);
        Ok(root_off)
    }

    fn encode_node(&self, idx: usize, buf: &mut Vec<u8>) -> Result<u64> {
        match &self.nodes[idx] {
            Node::Leaf { keys, hints, .. } => {
                let off = buf.len() as u64;
                buf.write_u8(LEAF_TAG)?;
                buf.write_u16::<BigEndian>(keys.len() as u16)?;
                for (key, hint) in keys.iter().zip(hints) {
                    buf.write_u32::<BigEndian>(key.len() as u32)?;
                    buf.extend_from_slice(key);
                    buf.write_u64::<BigEndian>(hint.file_id)?;
                    let pos = self.key_pos(key).unwrap_or(hint.data_pos);
                    buf.write_u64::<BigEndian>(pos)?;
                }
                Ok(off)
            }
            Node::Internal { keys, children } => {
                let mut child_offs = Vec::with_capacity(children.len());
                for &child in children {
                    child_offs.push(self.encode_node(child, buf)?);
                }

                let off = buf.len() as u64;
                buf.write_u8(INTERNAL_TAG)?;
                buf.write_u16::<BigEndian>(keys.len() as u16)?;
                for key in keys {
                    buf.write_u32::<BigEndian>(key.len() as u32)?;
                    buf.extend_from_slice(key);
                }
                for child_off in child_offs {
                    buf.write_u64::<BigEndian>(child_off)?;
                }
                Ok(off)
            }
        }
    }
}

/// Root record of a persisted per-segment B+-tree: the root node address
/// plus the key range the segment covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BPTreeRootIdx {
    pub root_off: u64,
    pub f_id: u64,
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl BPTreeRootIdx {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(24 + self.start.len() + self.end.len());
        buf.write_u64::<BigEndian>(self.root_off)?;
        buf.write_u64::<BigEndian>(self.f_id)?;
        buf.write_u32::<BigEndian>(self.start.len() as u32)?;
        buf.write_u32::<BigEndian>(self.end.len() as u32)?;
        buf.extend_from_slice(&self.start);
        buf.extend_from_slice(&self.end);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 24 {
            return Err(errdata!("b+tree root record truncated"));
        }
        let mut cursor = Cursor::new(buf);
        let root_off = cursor.read_u64::<BigEndian>()?;
        let f_id = cursor.read_u64::<BigEndian>()?;
        let start_size = cursor.read_u32::<BigEndian>()? as usize;
        let end_size = cursor.read_u32::<BigEndian>()? as usize;
        if buf.len() < 24 + start_size + end_size {
            return Err(errdata!("b+tree root record truncated"));
        }
        Ok(Self {
            root_off,
            f_id,
            start: buf[24..24 + start_size].to_vec(),
            end: buf[24 + start_size..24 + start_size + end_size].to_vec(),
        })
    }

    pub fn persist(&self, path: &Path, sync: bool) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.encode()?)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::decode(&buf)
    }
}

/// Point lookup against a persisted tree: descends from the root node at
/// `root_off` and returns the `(file_id, data_pos)` stored for `key`.
pub fn search(path: &Path, root_off: u64, key: &[u8]) -> Result<Option<(u64, u64)>> {
    let buf = std::fs::read(path)?;
    let mut off = root_off as usize;

    loop {
        if off >= buf.len() {
            return Err(errdata!("b+tree node offset {off} out of bounds"));
        }
        let mut cursor = Cursor::new(&buf[off..]);
        let tag = cursor.read_u8()?;
        let count = cursor.read_u16::<BigEndian>()? as usize;

        if tag == LEAF_TAG {
            for _ in 0..count {
                let key_len = cursor.read_u32::<BigEndian>()? as usize;
                let pos = off + cursor.position() as usize;
                if buf.len() < pos + key_len {
                    return Err(errdata!("b+tree leaf truncated"));
                }
                let node_key = &buf[pos..pos + key_len];
                cursor.set_position(cursor.position() + key_len as u64);
                let file_id = cursor.read_u64::<BigEndian>()?;
                let data_pos = cursor.read_u64::<BigEndian>()?;
                if node_key == key {
                    return Ok(Some((file_id, data_pos)));
                }
            }
            return Ok(None);
        }

        // Internal node: route to the child the key sorts into.
        let mut child_idx = count;
        for i in 0..count {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let pos = off + cursor.position() as usize;
            if buf.len() < pos + key_len {
                return Err(errdata!("b+tree internal node truncated"));
            }
            let node_key = &buf[pos..pos + key_len];
            cursor.set_position(cursor.position() + key_len as u64);
            if key < node_key && child_idx == count {
                child_idx = i;
            }
        }
        for i in 0..=count {
            let child_off = cursor.read_u64::<BigEndian>()?;
            if i == child_idx {
                off = child_off as usize;
                break;
            }
        }
    }
}

/// Path of the persisted B+-tree for segment `f_id`.
pub fn bpt_path(dir: &Path, f_id: u64) -> PathBuf {
    dir.join(format!("BPT-{f_id}"))
}

/// Path of the root record for segment `f_id`.
pub fn bpt_root_path(dir: &Path, f_id: u64) -> PathBuf {
    dir.join(format!("BPTRoot-{f_id}"))
}

/// Path of the committed-TxID tree for segment `f_id`.
pub fn bpt_tx_id_path(dir: &Path, f_id: u64) -> PathBuf {
    dir.join(format!("BPTTxID-{f_id}"))
}

/// Path of the committed-TxID root record for segment `f_id`.
pub fn bpt_root_tx_id_path(dir: &Path, f_id: u64) -> PathBuf {
    dir.join(format!("BPTRootTxID-{f_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bptree::tests::hint;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_write_nodes_root_is_last() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = bpt_path(dir.path(), 0);

        let mut tree = BPTree::new();
        for k in 0..50u64 {
            let key = format!("key-{k:03}").into_bytes();
            tree.insert(key.clone(), hint(&key, k));
        }

        let root_off = tree.write_nodes(&path, true).expect("Failed to persist tree");
        let len = std::fs::metadata(&path).expect("Failed to stat").len();

        // Children are written before parents, so the root sits at the
        // end of the file.
        assert!(root_off < len);
        assert_eq!(tree.root_address(), Some(root_off));
    }

    #[test]
    fn test_write_nodes_applies_key_pos_map() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = bpt_path(dir.path(), 1);

        let mut tree = BPTree::new();
        tree.insert(b"k".to_vec(), hint(b"k", 5));

        let mut map = HashMap::new();
        map.insert(b"k".to_vec(), 777u64);
        tree.set_key_pos_map(map);

        tree.write_nodes(&path, false).expect("Failed to persist tree");
        let buf = std::fs::read(&path).expect("Failed to read tree file");

        // Single leaf: tag, count, key_len, "k", file_id, data_pos.
        let pos = u64::from_be_bytes(buf[buf.len() - 8..].try_into().unwrap());
        assert_eq!(pos, 777);
    }

    #[test]
    fn test_search_persisted_tree() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = bpt_path(dir.path(), 4);

        let mut tree = BPTree::new();
        for k in 0..100u64 {
            let key = format!("key-{k:03}").into_bytes();
            tree.insert(key.clone(), hint(&key, k * 10));
        }
        let root_off = tree.write_nodes(&path, false).expect("Failed to persist tree");

        for k in 0..100u64 {
            let key = format!("key-{k:03}").into_bytes();
            let found = search(&path, root_off, &key).expect("Failed to search tree");
            assert_eq!(found, Some((0, k * 10)), "key-{k:03} must resolve");
        }

        assert_eq!(
            search(&path, root_off, b"missing").expect("Failed to search tree"),
            None
        );
    }

    #[test]
    fn test_root_idx_roundtrip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = bpt_root_path(dir.path(), 9);

        let idx = BPTreeRootIdx {
            root_off: 1234,
            f_id: 9,
            start: b"aaa".to_vec(),
            end: b"zzz".to_vec(),
        };
        idx.persist(&path, true).expect("Failed to persist root idx");

        let loaded = BPTreeRootIdx::load(&path).expect("Failed to load root idx");
        assert_eq!(loaded, idx);
    }

    #[test]
    fn test_empty_tree_persists() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = bpt_path(dir.path(), 2);

        let mut tree = BPTree::new();
        let root_off = tree.write_nodes(&path, false).expect("Failed to persist tree");
        assert_eq!(root_off, 0);
        // One empty leaf: tag byte plus zero count.
        assert_eq!(std::fs::metadata(&path).expect("Failed to stat").len(), 3);
    }
}
