//! Persistent free lists of garbage items.
//!
//! A bin chains bags from the oldest (`bag_first`) to the newest (`bag_last`). Items are
//! appended to the newest bag and reclaimed from the oldest one, so a bin is a FIFO queue.
//! Pool bins always keep their last bag, container bins release every bag once it runs empty.
use tracing::trace;

use crate::{
    error::{GcError, Result},
    gc_type::GcType,
    layout::{GcBag, GcBin, GcItem, Record},
    umem::{Umem, UmemOff},
};

/// Partition of garbage bins.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Scope {
    Pool,
    /// Bins of the container descriptor at this offset.
    Container(UmemOff),
}

/// Location of one bin: the record owning it and the garbage type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BinRef {
    owner: UmemOff,
    ty: GcType,
    pool_scope: bool,
}

impl BinRef {
    pub fn new(pool_df: UmemOff, scope: Scope, ty: GcType) -> Self {
        match scope {
            Scope::Pool => Self {
                owner: pool_df,
                ty,
                pool_scope: true,
            },
            Scope::Container(cont) => {
                assert!(
                    ty != GcType::Container,
                    "containers do not hold container garbage"
                );
                Self {
                    owner: cont,
                    ty,
                    pool_scope: false,
                }
            }
        }
    }

    pub fn ty(&self) -> GcType {
        self.ty
    }
}

fn bin(umem: &Umem, bin: BinRef) -> &GcBin {
    umem.record(bin.owner).gc_bin(bin.ty)
}

fn bin_mut(umem: &mut Umem, bin: BinRef) -> Result<&mut GcBin> {
    umem.tx_add(bin.owner)?;
    Ok(umem.record_mut(bin.owner).gc_bin_mut(bin.ty))
}

/// Allocates the first bag of every pool bin.
pub fn init_pool_bins(umem: &mut Umem, pool_df: UmemOff) -> Result<()> {
    for ty in GcType::ALL {
        let bref = BinRef::new(pool_df, Scope::Pool, ty);
        let bag_size = bin(umem, bref).bag_size;
        let bag = umem.alloc(Record::GcBag(GcBag::new(bag_size)))?;
        let pool_bin = bin_mut(umem, bref)?;
        pool_bin.bag_first = bag;
        pool_bin.bag_last = bag;
        pool_bin.bag_nr = 1;
    }
    Ok(())
}

/// Returns the newest bag, allocating a new one if there is no bag or the newest is full.
fn find_bag(umem: &mut Umem, bref: BinRef) -> Result<UmemOff> {
    let GcBin {
        bag_last,
        bag_size,
        bag_nr,
        ..
    } = *bin(umem, bref);
    if !bag_last.is_null() && !umem.gc_bag(bag_last).is_full() {
        return Ok(bag_last);
    }
    let bag_nr = bag_nr.checked_add(1).ok_or(GcError::NoSpace)?;

    let bag = umem.alloc(Record::GcBag(GcBag::new(bag_size)))?;
    if bag_last.is_null() {
        bin_mut(umem, bref)?.bag_first = bag;
    } else {
        umem.tx_add(bag_last)?;
        umem.gc_bag_mut(bag_last).next = bag;
    }
    let bin = bin_mut(umem, bref)?;
    bin.bag_last = bag;
    bin.bag_nr = bag_nr;
    trace!(ty = %bref.ty, bag = %bag, bags = bin.bag_nr, "new garbage bag");
    Ok(bag)
}

/// Appends `item` to the bin. Fails with `NoSpace` if a new bag cannot be allocated or the bin
/// already chains the maximum number of bags.
pub fn add_item(umem: &mut Umem, bref: BinRef, item: GcItem) -> Result<()> {
    let bag = find_bag(umem, bref)?;
    umem.tx_add(bag)?;
    umem.gc_bag_mut(bag).push(item);
    Ok(())
}

/// Oldest item of the bin.
pub fn peek_item(umem: &Umem, bref: BinRef) -> Option<GcItem> {
    let first = bin(umem, bref).bag_first;
    if first.is_null() {
        return None;
    }
    let bag = umem.gc_bag(first);
    if bag.is_empty() {
        assert!(bag.next.is_null(), "empty garbage bag in front of a chain");
        return None;
    }
    bag.front()
}

/// Releases the oldest bag once it ran empty, unless it is the sole bag of a pool bin which is
/// reset instead.
fn free_bag(umem: &mut Umem, bref: BinRef, bag_off: UmemOff) -> Result<()> {
    let GcBin {
        bag_first,
        bag_last,
        bag_nr,
        ..
    } = *bin(umem, bref);
    assert_eq!(bag_off, bag_first);

    if bref.pool_scope && bag_off == bag_last {
        assert_eq!(bag_nr, 1);
        umem.tx_add(bag_off)?;
        umem.gc_bag_mut(bag_off).reset();
        return Ok(());
    }

    let next = umem.gc_bag(bag_off).next;
    if bref.pool_scope {
        assert!(bag_nr > 1 && !next.is_null());
    } else {
        assert!(bag_nr > 0);
    }
    let bin = bin_mut(umem, bref)?;
    bin.bag_first = next;
    bin.bag_nr -= 1;
    if next.is_null() {
        bin.bag_last = UmemOff::NULL;
    }
    umem.free(bag_off)
}

/// Removes the oldest item of the bin. The bin must not be empty.
pub fn pop_item(umem: &mut Umem, bref: BinRef) -> Result<GcItem> {
    let first = bin(umem, bref).bag_first;
    let (item, last_item) = match umem.get(first) {
        Some(Record::GcBag(bag)) if !bag.is_empty() => (bag.front(), bag.nr == 1),
        _ => panic!("pop from an empty {} bin", bref.ty),
    };
    let item = item.unwrap_or_default();
    if last_item {
        free_bag(umem, bref, first)?;
        return Ok(item);
    }
    umem.tx_add(first)?;
    Ok(umem.gc_bag_mut(first).pop())
}

/// Splices every bag of `src` after the newest bag of `dest` and empties `src`. A sole empty
/// bag of `dest` is released and replaced by the chain of `src`. Fails with `NoSpace` if the
/// joined chain would exceed the bag counter.
pub fn move_bin(umem: &mut Umem, dest: BinRef, src: BinRef) -> Result<()> {
    let from = *bin(umem, src);
    if from.bag_first.is_null() {
        return Ok(());
    }
    let GcBin {
        bag_last: dest_last,
        bag_nr: dest_nr,
        ..
    } = *bin(umem, dest);

    if dest_last.is_null() || umem.gc_bag(dest_last).is_empty() {
        if !dest_last.is_null() {
            assert_eq!(dest_nr, 1, "empty bag behind live bags");
            umem.free(dest_last)?;
        }
        let to = bin_mut(umem, dest)?;
        to.bag_first = from.bag_first;
        to.bag_last = from.bag_last;
        to.bag_nr = from.bag_nr;
    } else {
        let bag_nr = dest_nr.checked_add(from.bag_nr).ok_or(GcError::NoSpace)?;
        umem.tx_add(dest_last)?;
        umem.gc_bag_mut(dest_last).next = from.bag_first;
        let to = bin_mut(umem, dest)?;
        to.bag_last = from.bag_last;
        to.bag_nr = bag_nr;
    }
    trace!(ty = %src.ty, bags = from.bag_nr, "spliced garbage bags");

    bin_mut(umem, src)?.clear();
    Ok(())
}

/// Whether the bin owns at least one bag.
pub fn is_allocated(umem: &Umem, bref: BinRef) -> bool {
    !bin(umem, bref).bag_first.is_null()
}

pub fn bag_count(umem: &Umem, bref: BinRef) -> u16 {
    bin(umem, bref).bag_nr
}

/// Items of the bin from the oldest to the newest.
pub fn items(umem: &Umem, bref: BinRef) -> Vec<GcItem> {
    let mut items = Vec::new();
    let mut bag = bin(umem, bref).bag_first;
    while !bag.is_null() {
        let rec = umem.gc_bag(bag);
        items.extend(rec.iter());
        bag = rec.next;
    }
    items
}

pub fn len(umem: &Umem, bref: BinRef) -> usize {
    let mut len = 0;
    let mut bag = bin(umem, bref).bag_first;
    while !bag.is_null() {
        let rec = umem.gc_bag(bag);
        len += rec.nr as usize;
        bag = rec.next;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{ContDf, PoolDf},
        umem::Fault,
    };

    fn pool(bag_size: u16) -> (Umem, UmemOff) {
        let mut umem = Umem::new(64 << 20);
        umem.tx_begin().unwrap();
        let pool_df = umem.alloc(Record::Pool(PoolDf::new(bag_size))).unwrap();
        init_pool_bins(&mut umem, pool_df).unwrap();
        umem.tx_end(Ok(())).unwrap();
        (umem, pool_df)
    }

    fn item(i: u64) -> GcItem {
        GcItem::new(UmemOff::NULL, i)
    }

    #[test]
    fn pool_bin_keeps_last_bag() {
        let (mut umem, pool_df) = pool(4);
        let akeys = BinRef::new(pool_df, Scope::Pool, GcType::Akey);
        let bag = bin(&umem, akeys).bag_first;
        umem.tx_begin().unwrap();
        for i in 0..6 {
            add_item(&mut umem, akeys, item(i)).unwrap();
        }
        assert_eq!(bag_count(&umem, akeys), 2);
        for i in 0..6 {
            assert_eq!(peek_item(&umem, akeys), Some(item(i)));
            assert_eq!(pop_item(&mut umem, akeys).unwrap(), item(i));
        }
        umem.tx_end(Ok(())).unwrap();

        assert_eq!(peek_item(&umem, akeys), None);
        assert_eq!(bag_count(&umem, akeys), 1);
        assert_ne!(bin(&umem, akeys).bag_first, bag, "drained head bag is released");
        assert!(umem.gc_bag(bin(&umem, akeys).bag_first).is_empty());
    }

    #[test]
    fn container_bin_releases_every_bag() {
        let (mut umem, pool_df) = pool(4);
        umem.tx_begin().unwrap();
        let cont = umem.alloc(Record::Container(ContDf::new(4))).unwrap();
        let objs = BinRef::new(pool_df, Scope::Container(cont), GcType::Object);
        assert!(!is_allocated(&umem, objs));
        add_item(&mut umem, objs, item(1)).unwrap();
        assert!(is_allocated(&umem, objs));
        pop_item(&mut umem, objs).unwrap();
        assert!(!is_allocated(&umem, objs));
        assert_eq!(bin(&umem, objs).bag_last, UmemOff::NULL);
        umem.tx_end(Ok(())).unwrap();
    }

    #[test]
    fn move_bin_appends_container_bags() {
        let (mut umem, pool_df) = pool(4);
        umem.tx_begin().unwrap();
        let cont = umem.alloc(Record::Container(ContDf::new(4))).unwrap();
        let dest = BinRef::new(pool_df, Scope::Pool, GcType::Dkey);
        let src = BinRef::new(pool_df, Scope::Container(cont), GcType::Dkey);
        for i in 0..5 {
            add_item(&mut umem, dest, item(i)).unwrap();
        }
        for i in 5..14 {
            add_item(&mut umem, src, item(i)).unwrap();
        }
        move_bin(&mut umem, dest, src).unwrap();
        umem.tx_end(Ok(())).unwrap();

        assert!(!is_allocated(&umem, src));
        assert_eq!(bag_count(&umem, dest), 2 + 3);
        assert_eq!(
            items(&umem, dest).iter().map(|it| it.args).collect::<Vec<_>>(),
            (0..14).collect::<Vec<_>>()
        );
    }

    #[test]
    fn move_bin_replaces_empty_pool_bag() {
        let (mut umem, pool_df) = pool(4);
        let live = umem.live_records();
        umem.tx_begin().unwrap();
        let cont = umem.alloc(Record::Container(ContDf::new(4))).unwrap();
        let dest = BinRef::new(pool_df, Scope::Pool, GcType::Object);
        let src = BinRef::new(pool_df, Scope::Container(cont), GcType::Object);
        add_item(&mut umem, src, item(9)).unwrap();
        let src_bag = bin(&umem, src).bag_first;
        move_bin(&mut umem, dest, src).unwrap();
        umem.tx_end(Ok(())).unwrap();

        assert_eq!(bin(&umem, dest).bag_first, src_bag);
        assert_eq!(bag_count(&umem, dest), 1);
        // container and its bag are new, the old empty pool bag is gone
        assert_eq!(umem.live_records(), live + 1);
    }

    #[test]
    fn add_item_without_space_fails() {
        let (mut umem, pool_df) = pool(2);
        let akeys = BinRef::new(pool_df, Scope::Pool, GcType::Akey);
        umem.tx_begin().unwrap();
        add_item(&mut umem, akeys, item(0)).unwrap();
        add_item(&mut umem, akeys, item(1)).unwrap();
        umem.inject(Fault::Alloc);
        assert_eq!(add_item(&mut umem, akeys, item(2)), Err(GcError::NoSpace));
        assert_eq!(umem.tx_end(Err(GcError::NoSpace)), Err(GcError::NoSpace));
        assert_eq!(len(&umem, akeys), 0);
    }

    #[test]
    fn bag_counter_limit_is_no_space() {
        let (mut umem, pool_df) = pool(1);
        let akeys = BinRef::new(pool_df, Scope::Pool, GcType::Akey);
        umem.tx_begin().unwrap();
        add_item(&mut umem, akeys, item(0)).unwrap();
        bin_mut(&mut umem, akeys).unwrap().bag_nr = u16::MAX;
        umem.tx_end(Ok(())).unwrap();
        let live = umem.live_records();

        umem.tx_begin().unwrap();
        assert_eq!(add_item(&mut umem, akeys, item(1)), Err(GcError::NoSpace));
        assert_eq!(umem.tx_end(Err(GcError::NoSpace)), Err(GcError::NoSpace));
        assert_eq!(umem.live_records(), live);
        assert_eq!(bag_count(&umem, akeys), u16::MAX);
        assert_eq!(len(&umem, akeys), 1);
    }

    #[test]
    fn move_bin_refuses_counter_overflow() {
        let (mut umem, pool_df) = pool(1);
        umem.tx_begin().unwrap();
        let cont = umem.alloc(Record::Container(ContDf::new(1))).unwrap();
        let dest = BinRef::new(pool_df, Scope::Pool, GcType::Dkey);
        let src = BinRef::new(pool_df, Scope::Container(cont), GcType::Dkey);
        add_item(&mut umem, dest, item(0)).unwrap();
        add_item(&mut umem, src, item(1)).unwrap();
        add_item(&mut umem, src, item(2)).unwrap();
        bin_mut(&mut umem, dest).unwrap().bag_nr = u16::MAX - 1;
        umem.tx_end(Ok(())).unwrap();

        umem.tx_begin().unwrap();
        assert_eq!(move_bin(&mut umem, dest, src), Err(GcError::NoSpace));
        assert_eq!(umem.tx_end(Err(GcError::NoSpace)), Err(GcError::NoSpace));
        assert_eq!(bag_count(&umem, src), 2);
        assert_eq!(bag_count(&umem, dest), u16::MAX - 1);
    }
}
