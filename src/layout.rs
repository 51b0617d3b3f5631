//! Durable record formats.
//!
//! Everything in this module is stored in the persistent heap ([Umem]) and must only be
//! modified inside a transaction.
use modular_bitfield::prelude::*;

use crate::{
    gc_type::{GcType, GC_MAX},
    globals::{GC_BAG_HEADER_SIZE, GC_ITEM_SIZE},
    tree::{TreeKind, TreeRoot},
    umem::{Umem, UmemOff},
};

pub const POOL_DF_SIZE: usize = 256;
pub const CONT_DF_SIZE: usize = 256;
pub const OBJ_DF_SIZE: usize = 64;
pub const KREC_SIZE: usize = 64;
pub const DTX_TABLE_SIZE: usize = 128;

/// A reclaimable persistent object. The item does not own `addr`.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct GcItem {
    pub addr: UmemOff,
    /// Reserved argument of the item, e.g. the size of an extent.
    pub args: u64,
}

impl GcItem {
    pub const fn new(addr: UmemOff, args: u64) -> Self {
        Self { addr, args }
    }
}

/// Fixed capacity ring of garbage items. Items are appended at `last` and popped at `first`.
#[derive(Clone, Debug)]
pub struct GcBag {
    pub first: u16,
    pub last: u16,
    pub nr: u16,
    /// Next (newer) bag chained on the bin.
    pub next: UmemOff,
    items: Box<[GcItem]>,
}

impl GcBag {
    pub fn new(capacity: u16) -> Self {
        assert!(capacity > 0, "garbage bag must hold at least one item");
        Self {
            first: 0,
            last: 0,
            nr: 0,
            next: UmemOff::NULL,
            items: vec![GcItem::default(); capacity as usize].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.items.len() as u16
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nr == 0
    }
    #[inline]
    pub fn is_full(&self) -> bool {
        self.nr == self.capacity()
    }

    fn advance(&self, cursor: u16) -> u16 {
        let next = cursor + 1;
        if next == self.capacity() {
            0
        } else {
            next
        }
    }

    pub fn push(&mut self, item: GcItem) {
        assert!(!self.is_full(), "push to a full garbage bag");
        self.items[self.last as usize] = item;
        self.last = self.advance(self.last);
        self.nr += 1;
    }

    pub fn front(&self) -> Option<GcItem> {
        if self.is_empty() {
            None
        } else {
            Some(self.items[self.first as usize])
        }
    }

    pub fn pop(&mut self) -> GcItem {
        assert!(!self.is_empty(), "pop from an empty garbage bag");
        let item = self.items[self.first as usize];
        self.first = self.advance(self.first);
        self.nr -= 1;
        item
    }

    pub fn reset(&mut self) {
        self.first = 0;
        self.last = 0;
        self.nr = 0;
    }

    /// Items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = GcItem> + '_ {
        let cap = self.capacity() as usize;
        (0..self.nr as usize).map(move |i| self.items[(self.first as usize + i) % cap])
    }
}

/// All pending garbage of one type in one scope: a singly linked list of bags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GcBin {
    /// Oldest bag.
    pub bag_first: UmemOff,
    /// Newest bag.
    pub bag_last: UmemOff,
    /// Capacity of every bag in this bin.
    pub bag_size: u16,
    pub bag_nr: u16,
}

impl GcBin {
    pub const fn new(bag_size: u16) -> Self {
        Self {
            bag_first: UmemOff::NULL,
            bag_last: UmemOff::NULL,
            bag_size,
            bag_nr: 0,
        }
    }

    pub fn clear(&mut self) {
        self.bag_first = UmemOff::NULL;
        self.bag_last = UmemOff::NULL;
        self.bag_nr = 0;
    }
}

/// Pool root. Pool bins are allocated once at creation and never released.
#[derive(Clone, Debug)]
pub struct PoolDf {
    pub bins: [GcBin; GC_MAX],
}

impl PoolDf {
    pub fn new(bag_size: u16) -> Self {
        Self {
            bins: [GcBin::new(bag_size); GC_MAX],
        }
    }
}

/// Container descriptor. Containers never hold container garbage.
#[derive(Clone, Debug)]
pub struct ContDf {
    pub bins: [GcBin; GC_MAX - 1],
    pub obj_root: TreeRoot,
    /// Committed transaction table of the container, destroyed before the container is drained.
    pub dtx_table: UmemOff,
    /// Set once the container is punched and handed to the collector.
    pub destroyed: bool,
}

impl ContDf {
    pub fn new(bag_size: u16) -> Self {
        Self {
            bins: [GcBin::new(bag_size); GC_MAX - 1],
            obj_root: TreeRoot::new(TreeKind::Object),
            dtx_table: UmemOff::NULL,
            destroyed: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjDf {
    pub tree: TreeRoot,
}

impl ObjDf {
    pub fn new() -> Self {
        Self {
            tree: TreeRoot::new(TreeKind::Dkey),
        }
    }
}

impl Default for ObjDf {
    fn default() -> Self {
        Self::new()
    }
}

// KeyRecord flags
//
// +-----------+------+----------------------------------------------------+
// | name      | bits |                                                    |
// +-----------+------+----------------------------------------------------+
// | evt       |    1 | Values are kept in an extent tree.                 |
// | btr       |    1 | Children are kept in a btree.                      |
// | dkey      |    1 | Distribution key, otherwise attribute key.         |
// | no_akey   |    1 | Flattened dkey: values hang directly off the dkey. |
// | reserved  |    4 |                                                    |
// +-----------+------+----------------------------------------------------+
#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
pub struct KrecFlags {
    evt: bool,
    btr: bool,
    dkey: bool,
    no_akey: bool,
    #[skip]
    __: B4,
}

#[derive(Clone)]
pub struct KeyRecord {
    flags: KrecFlags,
    pub tree: TreeRoot,
}

impl KeyRecord {
    /// Attribute key with values in a single value btree, or an extent tree if `extents`.
    pub fn akey(extents: bool) -> Self {
        let (flags, kind) = if extents {
            (KrecFlags::new().with_evt(true), TreeKind::Extent)
        } else {
            (KrecFlags::new().with_btr(true), TreeKind::SingleValue)
        };
        Self {
            flags,
            tree: TreeRoot::new(kind),
        }
    }

    /// Key left behind by a punch, without any subtree.
    pub fn punched() -> Self {
        Self {
            flags: KrecFlags::new(),
            tree: TreeRoot::new(TreeKind::SingleValue),
        }
    }

    pub fn dkey() -> Self {
        Self {
            flags: KrecFlags::new().with_dkey(true).with_btr(true),
            tree: TreeRoot::new(TreeKind::Akey),
        }
    }

    /// Distribution key storing single values without an akey level.
    pub fn flat_dkey() -> Self {
        Self {
            flags: KrecFlags::new()
                .with_dkey(true)
                .with_no_akey(true)
                .with_btr(true),
            tree: TreeRoot::new(TreeKind::SingleValue),
        }
    }

    pub fn has_btr(&self) -> bool {
        self.flags.btr()
    }
    pub fn has_evt(&self) -> bool {
        self.flags.evt()
    }
    pub fn is_dkey(&self) -> bool {
        self.flags.dkey()
    }
    pub fn no_akey(&self) -> bool {
        self.flags.no_akey()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ValueRecord {
    pub size: usize,
}

impl ValueRecord {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct DtxTable {
    pub committed: u32,
}

#[derive(Clone)]
pub enum Record {
    Pool(PoolDf),
    Container(ContDf),
    Object(ObjDf),
    Key(KeyRecord),
    Value(ValueRecord),
    GcBag(GcBag),
    DtxTable(DtxTable),
}

impl Record {
    /// Space consumed in the persistent heap.
    pub fn size(&self) -> usize {
        match self {
            Record::Pool(_) => POOL_DF_SIZE,
            Record::Container(_) => CONT_DF_SIZE,
            Record::Object(_) => OBJ_DF_SIZE,
            Record::Key(_) => KREC_SIZE,
            Record::Value(v) => v.size,
            Record::GcBag(bag) => GC_BAG_HEADER_SIZE + bag.capacity() as usize * GC_ITEM_SIZE,
            Record::DtxTable(_) => DTX_TABLE_SIZE,
        }
    }

    pub fn gc_bin(&self, ty: GcType) -> &GcBin {
        match self {
            Record::Pool(pool) => &pool.bins[ty.index()],
            Record::Container(cont) => &cont.bins[ty.index()],
            _ => panic!("record does not own garbage bins"),
        }
    }

    pub fn gc_bin_mut(&mut self, ty: GcType) -> &mut GcBin {
        match self {
            Record::Pool(pool) => &mut pool.bins[ty.index()],
            Record::Container(cont) => &mut cont.bins[ty.index()],
            _ => panic!("record does not own garbage bins"),
        }
    }
}

macro_rules! record_accessors {
    ($($variant: ident => $ty: ty, $get: ident, $get_mut: ident;)*) => {
        impl Umem {
            $(
                pub fn $get(&self, off: UmemOff) -> &$ty {
                    match self.record(off) {
                        Record::$variant(v) => v,
                        _ => panic!(concat!("{} is not a ", stringify!($variant), " record"), off),
                    }
                }

                pub fn $get_mut(&mut self, off: UmemOff) -> &mut $ty {
                    match self.record_mut(off) {
                        Record::$variant(v) => v,
                        _ => panic!(concat!("{} is not a ", stringify!($variant), " record"), off),
                    }
                }
            )*
        }
    };
}

record_accessors! {
    Pool => PoolDf, pool_df, pool_df_mut;
    Container => ContDf, cont_df, cont_df_mut;
    Object => ObjDf, object, object_mut;
    Key => KeyRecord, key, key_mut;
    GcBag => GcBag, gc_bag, gc_bag_mut;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bag_wraps_around() {
        let mut bag = GcBag::new(3);
        for i in 1..=3 {
            bag.push(GcItem::new(UmemOff::NULL, i));
        }
        assert!(bag.is_full());
        assert_eq!(bag.pop().args, 1);
        assert_eq!(bag.pop().args, 2);
        bag.push(GcItem::new(UmemOff::NULL, 4));
        bag.push(GcItem::new(UmemOff::NULL, 5));
        assert_eq!(bag.last, 2);
        assert_eq!(
            bag.iter().map(|it| it.args).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(bag.front().map(|it| it.args), Some(3));
        bag.reset();
        assert!(bag.front().is_none());
    }

    #[test]
    fn key_flags() {
        let dkey = KeyRecord::flat_dkey();
        assert!(dkey.is_dkey() && dkey.no_akey() && dkey.has_btr() && !dkey.has_evt());
        let akey = KeyRecord::akey(true);
        assert!(akey.has_evt() && !akey.has_btr() && !akey.is_dkey());
        let punched = KeyRecord::punched();
        assert!(!punched.has_btr() && !punched.has_evt());
    }

    #[test]
    fn bag_record_size() {
        let bag = Record::GcBag(GcBag::new(250));
        assert_eq!(bag.size(), 64 + 250 * 16);
    }
}
