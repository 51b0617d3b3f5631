//! Persistent subtrees hanging off keys, objects and containers.
//!
//! The GC never walks a tree itself, it only asks a tree to drain a bounded number of
//! entries. Leaf values are released by the drain; structural entries (keys, objects) are
//! handed back so that they can be queued in the next finer garbage bin.
use std::collections::VecDeque;

use tracing::trace;

use crate::{
    error::{GcError, Result},
    gc_type::GcType,
    layout::{GcItem, Record},
    umem::{Umem, UmemOff},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TreeKind {
    /// Single values of an akey.
    SingleValue,
    /// Extents (array values) of an akey.
    Extent,
    /// Akeys of a dkey.
    Akey,
    /// Dkeys of an object.
    Dkey,
    /// Objects of a container.
    Object,
}

impl TreeKind {
    /// Garbage type of the entries of this tree, `None` for value trees.
    pub fn child_type(self) -> Option<GcType> {
        match self {
            TreeKind::SingleValue | TreeKind::Extent => None,
            TreeKind::Akey => Some(GcType::Akey),
            TreeKind::Dkey => Some(GcType::Dkey),
            TreeKind::Object => Some(GcType::Object),
        }
    }
}

/// Root of a tree embedded in its owner record. A root without entries storage has never
/// been created.
#[derive(Clone, Debug)]
pub struct TreeRoot {
    pub kind: TreeKind,
    entries: Option<VecDeque<UmemOff>>,
}

impl TreeRoot {
    pub fn new(kind: TreeKind) -> Self {
        Self {
            kind,
            entries: None,
        }
    }

    pub fn is_created(&self) -> bool {
        self.entries.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.len())
    }

    pub fn insert(&mut self, child: UmemOff) {
        self.entries.get_or_insert_with(VecDeque::new).push_back(child);
    }

    fn pop(&mut self) -> Option<UmemOff> {
        self.entries.as_mut().and_then(|entries| entries.pop_front())
    }
}

fn root(umem: &Umem, owner: UmemOff) -> &TreeRoot {
    match umem.record(owner) {
        Record::Key(key) => &key.tree,
        Record::Object(obj) => &obj.tree,
        Record::Container(cont) => &cont.obj_root,
        _ => panic!("record {} has no subtree", owner),
    }
}

fn root_mut(umem: &mut Umem, owner: UmemOff) -> &mut TreeRoot {
    match umem.record_mut(owner) {
        Record::Key(key) => &mut key.tree,
        Record::Object(obj) => &mut obj.tree,
        Record::Container(cont) => &mut cont.obj_root,
        _ => panic!("record {} has no subtree", owner),
    }
}

/// Adds `child` to the tree owned by `owner`. Must be called inside a transaction.
pub fn insert(umem: &mut Umem, owner: UmemOff, child: UmemOff) -> Result<()> {
    umem.tx_add(owner)?;
    root_mut(umem, owner).insert(child);
    Ok(())
}

/// Open handle on the tree embedded in `owner`.
pub struct TreeHandle {
    owner: UmemOff,
    kind: TreeKind,
}

impl TreeHandle {
    /// Fails with [GcError::NonExist] if the tree has never been created.
    pub fn open(umem: &Umem, owner: UmemOff) -> Result<Self> {
        let root = root(umem, owner);
        if !root.is_created() {
            return Err(GcError::NonExist);
        }
        Ok(Self {
            owner,
            kind: root.kind,
        })
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    /// Removes entries oldest first until the tree is empty or `credits` are consumed, one
    /// credit per entry. Values are freed, structural entries are appended to `children`.
    /// Returns true if the tree is empty.
    pub fn drain(
        &self,
        umem: &mut Umem,
        credits: &mut u32,
        children: &mut Vec<GcItem>,
    ) -> Result<bool> {
        if root(umem, self.owner).is_empty() {
            return Ok(true);
        }
        umem.tx_add(self.owner)?;
        while *credits > 0 {
            let entry = match root_mut(umem, self.owner).pop() {
                Some(entry) => entry,
                None => break,
            };
            match self.kind.child_type() {
                None => umem.free(entry)?,
                Some(_) => children.push(GcItem::new(entry, 0)),
            }
            *credits -= 1;
        }
        let empty = root(umem, self.owner).is_empty();
        trace!(owner = %self.owner, kind = ?self.kind, empty, credits = *credits, "drained tree");
        Ok(empty)
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{KeyRecord, ObjDf, ValueRecord};

    #[test]
    fn drain_values_consumes_credits() {
        let mut umem = Umem::new(1 << 20);
        umem.tx_begin().unwrap();
        let akey = umem.alloc(Record::Key(KeyRecord::akey(false))).unwrap();
        for _ in 0..5 {
            let v = umem.alloc(Record::Value(ValueRecord::new(32))).unwrap();
            insert(&mut umem, akey, v).unwrap();
        }

        let tree = TreeHandle::open(&umem, akey).unwrap();
        let mut children = Vec::new();
        let mut credits = 3;
        assert!(!tree.drain(&mut umem, &mut credits, &mut children).unwrap());
        assert_eq!(credits, 0);
        assert_eq!(umem.key(akey).tree.len(), 2);

        let mut credits = 10;
        assert!(tree.drain(&mut umem, &mut credits, &mut children).unwrap());
        assert_eq!(credits, 8);
        assert!(children.is_empty());
        tree.close();
        umem.tx_end(Ok(())).unwrap();
        assert_eq!(umem.live_records(), 1);
    }

    #[test]
    fn drain_structural_entries_returns_children() {
        let mut umem = Umem::new(1 << 20);
        umem.tx_begin().unwrap();
        let obj = umem.alloc(Record::Object(ObjDf::new())).unwrap();
        let mut dkeys = Vec::new();
        for _ in 0..3 {
            let dkey = umem.alloc(Record::Key(KeyRecord::dkey())).unwrap();
            insert(&mut umem, obj, dkey).unwrap();
            dkeys.push(dkey);
        }
        let tree = TreeHandle::open(&umem, obj).unwrap();
        assert_eq!(tree.kind().child_type(), Some(GcType::Dkey));
        let mut children = Vec::new();
        let mut credits = 8;
        assert!(tree.drain(&mut umem, &mut credits, &mut children).unwrap());
        assert_eq!(
            children.iter().map(|it| it.addr).collect::<Vec<_>>(),
            dkeys
        );
        umem.tx_end(Ok(())).unwrap();
    }

    #[test]
    fn never_created_tree_does_not_exist() {
        let mut umem = Umem::new(1 << 20);
        umem.tx_begin().unwrap();
        let punched = umem.alloc(Record::Key(KeyRecord::punched())).unwrap();
        umem.tx_end(Ok(())).unwrap();
        assert!(matches!(
            TreeHandle::open(&umem, punched),
            Err(GcError::NonExist)
        ));
    }
}
