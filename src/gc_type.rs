//! Reclaim policy of every garbage level.
//!
//! Levels are ordered from the finest to the coarsest: akey, dkey, object, container. Draining
//! a level flattens one structural layer of the item's subtree into the bin of the next finer
//! level, the akey level finally releases values and consumes the caller's credits.
use tracing::trace;

use crate::{
    bin::{self, BinRef, Scope},
    dtx,
    error::{GcError, Result},
    globals::{GC_CONT_DRAIN_CREDS, GC_DKEY_DRAIN_CREDS, GC_OBJ_DRAIN_CREDS},
    layout::GcItem,
    statistics::GcStat,
    tree::TreeHandle,
    umem::{Umem, UmemOff},
};

pub const GC_MAX: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum GcType {
    Akey = 0,
    Dkey,
    Object,
    Container,
}

impl GcType {
    pub const ALL: [GcType; GC_MAX] = [
        GcType::Akey,
        GcType::Dkey,
        GcType::Object,
        GcType::Container,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            GcType::Akey => "akey",
            GcType::Dkey => "dkey",
            GcType::Object => "object",
            GcType::Container => "container",
        }
    }

    /// Internal credits of one drain, `None` if the drain consumes the caller's credits.
    pub const fn drain_credits(self) -> Option<u32> {
        match self {
            GcType::Akey => None,
            GcType::Dkey => Some(GC_DKEY_DRAIN_CREDS),
            GcType::Object => Some(GC_OBJ_DRAIN_CREDS),
            GcType::Container => Some(GC_CONT_DRAIN_CREDS),
        }
    }

    /// Next coarser level.
    pub const fn parent(self) -> Option<GcType> {
        match self {
            GcType::Akey => Some(GcType::Dkey),
            GcType::Dkey => Some(GcType::Object),
            GcType::Object => Some(GcType::Container),
            GcType::Container => None,
        }
    }

    /// Next finer level.
    pub const fn child(self) -> Option<GcType> {
        match self {
            GcType::Akey => None,
            GcType::Dkey => Some(GcType::Akey),
            GcType::Object => Some(GcType::Dkey),
            GcType::Container => Some(GcType::Object),
        }
    }
}

impl std::fmt::Display for GcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DrainOutcome {
    /// The subtree was drained, `empty` tells whether anything is left.
    Drained { empty: bool },
    /// A container handed its leftover bins over to the pool instead of draining.
    HandedOff,
}

/// Everything a drain or free step may touch.
pub struct GcCtx<'a> {
    pub umem: &'a mut Umem,
    pub pool_df: UmemOff,
    pub scope: Scope,
    pub stat: &'a mut GcStat,
}

impl GcCtx<'_> {
    fn bin(&self, ty: GcType) -> BinRef {
        BinRef::new(self.pool_df, self.scope, ty)
    }

    /// Drains the subtree rooted in `owner`. Structural children are queued in the bins of
    /// the current scope.
    fn drain_tree(&mut self, owner: UmemOff, credits: &mut u32) -> Result<bool> {
        let tree = match TreeHandle::open(self.umem, owner) {
            Ok(tree) => tree,
            Err(GcError::NonExist) => return Ok(true),
            Err(e) => return Err(e),
        };
        let mut children = Vec::new();
        let rc = tree.drain(self.umem, credits, &mut children);
        let child_type = tree.kind().child_type();
        tree.close();
        let empty = rc?;

        if let Some(ty) = child_type {
            let bin = self.bin(ty);
            for child in children {
                bin::add_item(self.umem, bin, child)?;
            }
        }
        Ok(empty)
    }

    fn drain_key(&mut self, ty: GcType, item: &GcItem, credits: &mut u32) -> Result<bool> {
        let key = self.umem.key(item.addr);
        if ty == GcType::Dkey && key.no_akey() {
            // values are released once the key comes back as an akey
            return Ok(true);
        }
        let btr = key.has_btr();
        if !btr && !key.has_evt() {
            // punched key, nothing below it
            return Ok(true);
        }
        if !btr {
            assert_eq!(ty, GcType::Akey, "extent tree under a {} item", ty);
        }

        let creds = *credits;
        let empty = self.drain_tree(item.addr, credits)?;
        if ty == GcType::Akey {
            let released = u64::from(creds - *credits);
            if btr {
                self.stat.singvs += released;
            } else {
                self.stat.recxs += released;
            }
        }
        Ok(empty)
    }

    fn drain_cont(&mut self, item: &GcItem, credits: &mut u32) -> Result<DrainOutcome> {
        assert_eq!(self.scope, Scope::Pool, "container garbage outside of pool scope");
        dtx::destroy_table(self.umem, item.addr)?;

        for ty in [GcType::Akey, GcType::Dkey, GcType::Object] {
            let src = BinRef::new(self.pool_df, Scope::Container(item.addr), ty);
            if bin::is_allocated(self.umem, src) {
                let dest = self.bin(ty);
                bin::move_bin(self.umem, dest, src)?;
                trace!(cont = %item.addr, ty = %ty, "moved container bags to pool");
                return Ok(DrainOutcome::HandedOff);
            }
        }
        let empty = self.drain_tree(item.addr, credits)?;
        Ok(DrainOutcome::Drained { empty })
    }
}

impl GcType {
    /// Drains the subtree of `item`. Akey drains consume `credits`, coarser levels use their
    /// own allotment and leave `credits` untouched.
    pub fn drain(self, ctx: &mut GcCtx<'_>, item: &GcItem, credits: &mut u32) -> Result<DrainOutcome> {
        assert!(!item.addr.is_null(), "null {} item", self);
        let mut allot = match self.drain_credits() {
            Some(allot) => allot,
            None => *credits,
        };
        let empty = match self {
            GcType::Akey | GcType::Dkey => ctx.drain_key(self, item, &mut allot)?,
            GcType::Object => ctx.drain_tree(item.addr, &mut allot)?,
            GcType::Container => return ctx.drain_cont(item, &mut allot),
        };
        if self == GcType::Akey {
            assert!(*credits >= allot);
            *credits = allot;
        }
        Ok(DrainOutcome::Drained { empty })
    }

    /// Removes the oldest item of this level's bin and releases it. `item` must be the item
    /// returned by the last peek.
    pub fn free_item(self, ctx: &mut GcCtx<'_>, item: GcItem) -> Result<()> {
        let bin = ctx.bin(self);
        let popped = bin::pop_item(ctx.umem, bin)?;
        assert_eq!(popped, item, "{} bin changed under the collector", self);

        match self {
            GcType::Akey | GcType::Object => ctx.umem.free(item.addr)?,
            GcType::Dkey => {
                let key = ctx.umem.key(item.addr);
                assert!(key.is_dkey(), "{} is not a dkey", item.addr);
                if key.no_akey() {
                    let akeys = ctx.bin(GcType::Akey);
                    bin::add_item(ctx.umem, akeys, item)?;
                } else {
                    ctx.umem.free(item.addr)?;
                }
            }
            GcType::Container => {
                dtx::destroy_table(ctx.umem, item.addr)?;
                for ty in [GcType::Akey, GcType::Dkey, GcType::Object] {
                    let bin = BinRef::new(ctx.pool_df, Scope::Container(item.addr), ty);
                    assert!(
                        !bin::is_allocated(ctx.umem, bin),
                        "container {} freed with pending {} garbage",
                        item.addr,
                        ty
                    );
                }
                ctx.umem.free(item.addr)?;
            }
        }
        trace!(ty = %self, addr = %item.addr, "released");

        match self {
            GcType::Akey => ctx.stat.akeys += 1,
            GcType::Dkey => ctx.stat.dkeys += 1,
            GcType::Object => ctx.stat.objs += 1,
            GcType::Container => ctx.stat.conts += 1,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{ContDf, KeyRecord, ObjDf, PoolDf, Record, ValueRecord},
        tree,
    };

    struct Fixture {
        umem: Umem,
        pool_df: UmemOff,
        stat: GcStat,
    }

    impl Fixture {
        fn new() -> Self {
            let mut umem = Umem::new(64 << 20);
            umem.tx_begin().unwrap();
            let pool_df = umem.alloc(Record::Pool(PoolDf::new(16))).unwrap();
            bin::init_pool_bins(&mut umem, pool_df).unwrap();
            Self {
                umem,
                pool_df,
                stat: GcStat::default(),
            }
        }

        fn ctx(&mut self, scope: Scope) -> GcCtx<'_> {
            GcCtx {
                umem: &mut self.umem,
                pool_df: self.pool_df,
                scope,
                stat: &mut self.stat,
            }
        }

        fn akey(&mut self, values: usize, extents: bool) -> UmemOff {
            let akey = self
                .umem
                .alloc(Record::Key(KeyRecord::akey(extents)))
                .unwrap();
            for _ in 0..values {
                let v = self.umem.alloc(Record::Value(ValueRecord::new(16))).unwrap();
                tree::insert(&mut self.umem, akey, v).unwrap();
            }
            akey
        }
    }

    #[test]
    fn level_order() {
        assert_eq!(GcType::Akey.parent(), Some(GcType::Dkey));
        assert_eq!(GcType::Container.parent(), None);
        assert_eq!(GcType::Akey.child(), None);
        assert_eq!(GcType::Container.child(), Some(GcType::Object));
        assert!(GcType::Akey < GcType::Container);
        assert_eq!(GcType::Akey.drain_credits(), None);
        assert_eq!(GcType::Object.drain_credits(), Some(8));
    }

    #[test]
    fn akey_drain_consumes_caller_credits() {
        let mut fx = Fixture::new();
        let akey = fx.akey(10, true);
        let item = GcItem::new(akey, 0);
        let mut credits = 4;
        let outcome = GcType::Akey
            .drain(&mut fx.ctx(Scope::Pool), &item, &mut credits)
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Drained { empty: false });
        assert_eq!(credits, 0);
        assert_eq!(fx.stat.recxs, 4);
        assert_eq!(fx.stat.singvs, 0);
    }

    #[test]
    fn dkey_drain_flattens_into_akey_bin() {
        let mut fx = Fixture::new();
        let dkey = fx.umem.alloc(Record::Key(KeyRecord::dkey())).unwrap();
        for _ in 0..40 {
            let akey = fx.akey(0, false);
            tree::insert(&mut fx.umem, dkey, akey).unwrap();
        }
        let item = GcItem::new(dkey, 0);
        let mut credits = 5;
        let outcome = GcType::Dkey
            .drain(&mut fx.ctx(Scope::Pool), &item, &mut credits)
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Drained { empty: false });
        assert_eq!(credits, 5, "dkey drain must not touch the caller's credits");
        let akeys = BinRef::new(fx.pool_df, Scope::Pool, GcType::Akey);
        assert_eq!(bin::len(&fx.umem, akeys), GC_DKEY_DRAIN_CREDS as usize);
    }

    #[test]
    fn flat_dkey_is_requeued_as_akey() {
        let mut fx = Fixture::new();
        let dkey = fx.umem.alloc(Record::Key(KeyRecord::flat_dkey())).unwrap();
        let v = fx.umem.alloc(Record::Value(ValueRecord::new(16))).unwrap();
        tree::insert(&mut fx.umem, dkey, v).unwrap();
        let item = GcItem::new(dkey, 7);
        bin::add_item(
            &mut fx.umem,
            BinRef::new(fx.pool_df, Scope::Pool, GcType::Dkey),
            item,
        )
        .unwrap();

        let mut credits = 1;
        let mut ctx = fx.ctx(Scope::Pool);
        assert_eq!(
            GcType::Dkey.drain(&mut ctx, &item, &mut credits).unwrap(),
            DrainOutcome::Drained { empty: true }
        );
        GcType::Dkey.free_item(&mut ctx, item).unwrap();
        assert_eq!(fx.stat.dkeys, 1);
        assert!(fx.umem.get(dkey).is_some());
        let akeys = BinRef::new(fx.pool_df, Scope::Pool, GcType::Akey);
        assert_eq!(bin::peek_item(&fx.umem, akeys), Some(item));
    }

    #[test]
    fn container_hands_off_leftover_bins() {
        let mut fx = Fixture::new();
        let cont = fx.umem.alloc(Record::Container(ContDf::new(16))).unwrap();
        let obj = fx.umem.alloc(Record::Object(ObjDf::new())).unwrap();
        let cont_objs = BinRef::new(fx.pool_df, Scope::Container(cont), GcType::Object);
        bin::add_item(&mut fx.umem, cont_objs, GcItem::new(obj, 0)).unwrap();

        let item = GcItem::new(cont, 0);
        let mut credits = 1;
        let outcome = GcType::Container
            .drain(&mut fx.ctx(Scope::Pool), &item, &mut credits)
            .unwrap();
        assert_eq!(outcome, DrainOutcome::HandedOff);
        assert!(!bin::is_allocated(&fx.umem, cont_objs));
        let pool_objs = BinRef::new(fx.pool_df, Scope::Pool, GcType::Object);
        assert_eq!(bin::peek_item(&fx.umem, pool_objs), Some(GcItem::new(obj, 0)));

        let outcome = GcType::Container
            .drain(&mut fx.ctx(Scope::Pool), &item, &mut credits)
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Drained { empty: true });
    }
}
