//! A persistent pool and its collector state.
use std::{cell::RefCell, collections::VecDeque, rc::Rc, sync::Arc, time::Instant};

use hashbrown::HashMap;
use tracing::{debug, error, trace, warn};

use crate::{
    bin::{self, BinRef, Scope},
    container::{ContHandle, ContList, Container},
    dtx,
    error::{GcError, Result},
    gc_type::GcType,
    layout::{ContDf, GcItem, PoolDf, Record},
    statistics::{GcMetrics, GcStat},
    umem::{Umem, UmemOff},
    Config,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PoolId(pub u64);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Answer of the yield callback between two slices.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum YieldHint {
    /// Stop reclaiming.
    Abort,
    /// Continue with tight slices.
    Tight,
    /// Continue with slack slices.
    Slack,
}

/// Pools with pending garbage, oldest registration first. Shared between a runtime and its
/// pools.
#[derive(Clone, Default, Debug)]
pub struct GcWorklist(Rc<RefCell<VecDeque<PoolId>>>);

impl GcWorklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn front(&self) -> Option<PoolId> {
        self.0.borrow().front().copied()
    }

    pub fn contains(&self, id: PoolId) -> bool {
        self.0.borrow().contains(&id)
    }

    fn push(&self, id: PoolId) {
        self.0.borrow_mut().push_back(id);
    }

    fn remove(&self, id: PoolId) {
        self.0.borrow_mut().retain(|p| *p != id);
    }

    /// Moves `id` to the tail.
    pub(crate) fn requeue(&self, id: PoolId) {
        let mut list = self.0.borrow_mut();
        list.retain(|p| *p != id);
        list.push_back(id);
    }
}

pub struct Pool {
    pub(crate) id: PoolId,
    pub(crate) umem: Umem,
    pub(crate) df: UmemOff,
    pub(crate) config: Config,
    containers: HashMap<UmemOff, Container>,
    /// Open containers with garbage in their own bins.
    pub(crate) gc_conts: ContList,
    /// Whether the pool is on the worklist.
    gc_link: bool,
    /// Open references, the worklist holds one while the pool is attached.
    pub(crate) opened: u32,
    pub(crate) dying: bool,
    worklist: GcWorklist,
    /// Reclaimed since creation or the last reset.
    pub(crate) stat: GcStat,
    pub(crate) metrics: Option<Arc<GcMetrics>>,
}

impl Pool {
    /// Creates a pool with its own worklist.
    pub fn create(id: PoolId, config: Config) -> Result<Pool> {
        Self::create_in(id, config, GcWorklist::new())
    }

    pub(crate) fn create_in(id: PoolId, config: Config, worklist: GcWorklist) -> Result<Pool> {
        config.validate()?;
        let mut umem = Umem::new(config.pool_size);
        umem.tx_begin()?;
        let rc: Result<UmemOff> = (|| {
            let df = umem.alloc(Record::Pool(PoolDf::new(config.bag_size)))?;
            bin::init_pool_bins(&mut umem, df)?;
            Ok(df)
        })();
        umem.tx_end(rc.as_ref().map(|_| ()).map_err(Clone::clone))?;
        let df = rc?;
        debug!(pool = %id, bag_size = config.bag_size, "initialized garbage bins");

        Ok(Pool {
            id,
            umem,
            df,
            config,
            containers: HashMap::new(),
            gc_conts: ContList::default(),
            gc_link: false,
            opened: 0,
            dying: false,
            worklist,
            stat: GcStat::default(),
            metrics: None,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn umem(&self) -> &Umem {
        &self.umem
    }

    /// Direct access to the persistent heap, for producers building and punching trees.
    pub fn umem_mut(&mut self) -> &mut Umem {
        &mut self.umem
    }

    pub fn df(&self) -> UmemOff {
        self.df
    }

    pub fn is_dying(&self) -> bool {
        self.dying
    }

    pub fn set_metrics(&mut self, metrics: Arc<GcMetrics>) {
        self.metrics = Some(metrics);
    }

    pub fn tx_begin(&mut self) -> Result<()> {
        self.umem.tx_begin()
    }

    pub fn tx_end(&mut self, rc: Result<()>) -> Result<()> {
        self.umem.tx_end(rc)
    }

    /// Runs `f` in a transaction of its own (nested if one is open).
    fn with_tx<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.umem.tx_begin()?;
        let rc = f(self);
        self.umem
            .tx_end(rc.as_ref().map(|_| ()).map_err(Clone::clone))?;
        rc
    }

    /// Simulates a restart of the process owning the pool: an in-flight transaction is rolled
    /// back and transient state is rebuilt from the durable bins, including the bins of every
    /// live container.
    pub fn restart(&mut self) {
        self.umem.crash();
        self.containers.clear();
        self.gc_conts.clear();
        let conts: Vec<UmemOff> = self
            .umem
            .records()
            .filter_map(|(off, rec)| match rec {
                Record::Container(cont) if !cont.destroyed => Some(off),
                _ => None,
            })
            .collect();
        for df in conts {
            if self.cont_has_garbage(df) {
                self.gc_conts.push(df);
            }
        }
        let pending = !self.gc_conts.is_empty()
            || GcType::ALL.iter().any(|ty| {
                bin::peek_item(&self.umem, BinRef::new(self.df, Scope::Pool, *ty)).is_some()
            });
        if pending && !self.gc_link {
            self.attach();
        }
        debug!(pool = %self.id, pending, "pool restarted");
    }

    pub fn cont_create(&mut self) -> Result<UmemOff> {
        let bag_size = self.config.bag_size;
        let df = self.with_tx(|pool| {
            let df = pool.umem.alloc(Record::Container(ContDf::new(bag_size)))?;
            dtx::create_table(&mut pool.umem, df)?;
            Ok(df)
        })?;
        debug!(pool = %self.id, cont = %df, "created container");
        Ok(df)
    }

    fn check_cont(&self, df: UmemOff) -> Result<()> {
        match self.umem.get(df) {
            Some(Record::Container(cont)) if !cont.destroyed => Ok(()),
            _ => Err(GcError::NonExist),
        }
    }

    pub fn cont_open(&mut self, df: UmemOff) -> Result<ContHandle> {
        self.check_cont(df)?;
        let cont = self
            .containers
            .entry(df)
            .or_insert(Container { df, opened: 0 });
        cont.opened += 1;
        if cont.opened == 1 && self.cont_has_garbage(df) {
            // garbage left over from a previous open
            self.gc_conts.push(df);
            if !self.gc_link {
                self.attach();
            }
        }
        Ok(ContHandle::new(df))
    }

    /// Whether any bin of the container still owns a bag. Container bins release their last
    /// bag once drained, so an allocated bin holds items.
    fn cont_has_garbage(&self, df: UmemOff) -> bool {
        [GcType::Akey, GcType::Dkey, GcType::Object]
            .iter()
            .any(|ty| bin::is_allocated(&self.umem, BinRef::new(self.df, Scope::Container(df), *ty)))
    }

    pub fn cont_close(&mut self, coh: ContHandle) -> Result<()> {
        let cont = self
            .containers
            .get_mut(&coh.df())
            .ok_or(GcError::NoHandle)?;
        cont.opened -= 1;
        if cont.opened == 0 {
            let df = cont.df;
            self.containers.remove(&df);
            // reclaiming a container scope needs no open handle, keep pending garbage queued
            if !self.cont_has_garbage(df) {
                self.gc_conts.remove(df);
            }
        }
        Ok(())
    }

    pub fn cont_is_open(&self, df: UmemOff) -> bool {
        self.containers.contains_key(&df)
    }

    /// Punches the container: the descriptor and everything below it become garbage of the pool.
    pub fn cont_destroy(&mut self, df: UmemOff) -> Result<()> {
        self.check_cont(df)?;
        if self.containers.contains_key(&df) {
            return Err(GcError::Busy(format!("container {} is open", df)));
        }
        self.with_tx(|pool| {
            pool.umem.tx_add(df)?;
            pool.umem.cont_df_mut(df).destroyed = true;
            pool.gc_add_item(None, GcType::Container, df, 0)
        })?;
        // leftover bins are handed to the pool when the container item is drained
        self.gc_conts.remove(df);
        debug!(pool = %self.id, cont = %df, "destroyed container");
        Ok(())
    }

    fn attach(&mut self) {
        debug_assert!(!self.gc_link);
        trace!(pool = %self.id, "register pool for GC");
        self.gc_link = true;
        self.opened += 1;
        self.worklist.push(self.id);
    }

    /// Detaches the pool from the worklist. Returns true if nothing holds the pool open anymore.
    pub(crate) fn detach(&mut self) -> bool {
        assert!(self.gc_link && self.opened > 0);
        self.gc_link = false;
        self.opened -= 1;
        self.worklist.remove(self.id);
        self.opened == 0
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.gc_link
    }

    /// Queues `addr` for reclaim. Must be called inside an open transaction; garbage of an open
    /// container goes to the container's own bins.
    pub fn gc_add_item(
        &mut self,
        coh: Option<ContHandle>,
        ty: GcType,
        addr: UmemOff,
        args: u64,
    ) -> Result<()> {
        trace!(pool = %self.id, ty = %ty, addr = %addr, "add garbage");
        if self.dying {
            return Ok(());
        }
        if !self.umem.in_tx() {
            return Err(GcError::NoTx);
        }
        let scope = match coh {
            Some(coh) => {
                if !self.containers.contains_key(&coh.df()) {
                    return Err(GcError::NoHandle);
                }
                if ty == GcType::Container {
                    return Err(GcError::Invalid(
                        "container garbage belongs to the pool".into(),
                    ));
                }
                Scope::Container(coh.df())
            }
            None => Scope::Pool,
        };
        if addr.is_null() {
            return Err(GcError::Invalid("null garbage address".into()));
        }

        let rc = bin::add_item(
            &mut self.umem,
            BinRef::new(self.df, scope, ty),
            GcItem::new(addr, args),
        );
        if let Err(e) = rc {
            error!(pool = %self.id, error = %e, "failed to add item");
            return Err(e);
        }

        if !self.gc_link {
            self.attach();
        }
        if let Scope::Container(df) = scope {
            self.gc_conts.push(df);
        }
        Ok(())
    }

    pub fn gc_is_idle(&self) -> bool {
        !self.gc_link
    }

    /// One reclaim call with `credits`; the remaining credits are written back. Detaches the pool
    /// once it has nothing left.
    pub fn gc_reclaim_tight(&mut self, credits: &mut u32) -> Result<()> {
        if *credits == 0 {
            return Err(GcError::Invalid("zero credits".into()));
        }
        if !self.gc_link {
            return Ok(());
        }
        let total = *credits;
        let empty = self.reclaim(credits)?;
        if empty {
            if total != *credits {
                self.log_stats();
            }
            if self.gc_link {
                self.detach();
            }
        }
        Ok(())
    }

    /// Reclaims up to `credits` in tight slices. Returns the consumed credits.
    pub fn gc_run(&mut self, credits: u32) -> Result<u32> {
        if credits == 0 {
            return Err(GcError::Invalid("zero credits".into()));
        }
        self.gc_run_with_yield(credits, || YieldHint::Tight)
    }

    /// Reclaims in slices, asking `yield_fn` between two slices how to go on. `max_credits` of
    /// zero means until there is nothing left. Returns the consumed credits.
    pub fn gc_run_with_yield<F>(&mut self, max_credits: u32, mut yield_fn: F) -> Result<u32>
    where
        F: FnMut() -> YieldHint,
    {
        if !self.gc_link {
            return Ok(0);
        }
        let mut tight = true;
        let mut total = 0u32;

        loop {
            let mut creds = if tight {
                self.config.tight_credits
            } else {
                self.config.slack_credits
            };
            if max_credits > 0 && max_credits - total < creds {
                creds = max_credits - total;
            }

            let start = Instant::now();
            let slice = creds;
            let rc = self.gc_reclaim_tight(&mut creds);
            if let Some(metrics) = &self.metrics {
                metrics.record_slice(tight, start.elapsed());
            }
            if let Err(e) = rc {
                error!(pool = %self.id, error = %e, "GC pool failed");
                return Err(e);
            }
            total += slice - creds;

            if creds != 0 {
                break; // reclaimed everything
            }
            if max_credits > 0 && total >= max_credits {
                break;
            }
            match yield_fn() {
                YieldHint::Abort => {
                    debug!(pool = %self.id, "GC pool run aborted");
                    break;
                }
                YieldHint::Tight => tight = true,
                YieldHint::Slack => tight = false,
            }
        }
        if total != 0 {
            debug!(pool = %self.id, consumed = total, "GC consumed credits");
        }
        Ok(total)
    }

    pub fn stats(&self) -> &GcStat {
        &self.stat
    }

    pub fn reset_gc_stat(&mut self) {
        self.stat = GcStat::default();
    }

    pub(crate) fn log_stats(&self) {
        logln_if!(self.config.verbose, "{} {}", self.id, self.stat);
        if !self.config.verbose {
            debug!(pool = %self.id, stat = ?self.stat, "GC reclaimed");
        }
    }

    fn scope_of(&self, cont: Option<UmemOff>) -> Scope {
        match cont {
            Some(df) => Scope::Container(df),
            None => Scope::Pool,
        }
    }

    /// Pending items of one bin, oldest first.
    pub fn gc_bin_items(&self, cont: Option<UmemOff>, ty: GcType) -> Vec<GcItem> {
        bin::items(&self.umem, BinRef::new(self.df, self.scope_of(cont), ty))
    }

    pub fn gc_bin_len(&self, cont: Option<UmemOff>, ty: GcType) -> usize {
        bin::len(&self.umem, BinRef::new(self.df, self.scope_of(cont), ty))
    }

    pub fn gc_bag_count(&self, cont: Option<UmemOff>, ty: GcType) -> u16 {
        bin::bag_count(&self.umem, BinRef::new(self.df, self.scope_of(cont), ty))
    }

    /// Pending items of every bin of the pool and of its containers.
    pub fn gc_pending(&self) -> usize {
        let mut pending: usize = GcType::ALL.iter().map(|ty| self.gc_bin_len(None, *ty)).sum();
        for cont in self.gc_conts.iter() {
            pending += [GcType::Akey, GcType::Dkey, GcType::Object]
                .iter()
                .map(|ty| self.gc_bin_len(Some(cont), *ty))
                .sum::<usize>();
        }
        pending
    }

    /// Space kept back for garbage bags.
    pub fn gc_reserved_space(&self) -> usize {
        self.config.reserved_space()
    }

    pub(crate) fn kill(&mut self) {
        if self.dying {
            warn!(pool = %self.id, "pool destroyed twice");
        }
        self.dying = true;
        if self.gc_link {
            self.detach();
        }
    }
}
