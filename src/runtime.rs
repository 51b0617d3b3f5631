//! Collector runtime of one storage target.
//!
//! The runtime owns the pools of the target and the worklist of pools with pending garbage.
//! A pool counts as open while it has references: user handles plus the pin a pool takes when
//! it attaches itself to the worklist. Detaching drops the pin wherever it happens, so a pool
//! drained through a borrowed handle is closed as soon as nobody else holds it.
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, error, info, trace};

use crate::{
    error::{GcError, Result},
    globals::{GC_CREDS_MAX, GC_CREDS_MIN, GC_CREDS_TIGHT},
    pool::{GcWorklist, Pool, PoolId, YieldHint},
    statistics::GcMetrics,
    Config,
};

pub struct GcRuntime {
    config: Config,
    pools: HashMap<PoolId, Pool>,
    worklist: GcWorklist,
    metrics: Arc<GcMetrics>,
    next_id: u64,
}

impl GcRuntime {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pools: HashMap::new(),
            worklist: GcWorklist::new(),
            metrics: Arc::new(GcMetrics::new()),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<GcMetrics> {
        &self.metrics
    }

    pub fn worklist(&self) -> &GcWorklist {
        &self.worklist
    }

    pub fn create_pool(&mut self) -> Result<PoolId> {
        let id = PoolId(self.next_id);
        let mut pool = Pool::create_in(id, self.config.clone(), self.worklist.clone())?;
        pool.set_metrics(self.metrics.clone());
        self.next_id += 1;
        self.pools.insert(id, pool);
        info!(pool = %id, "created pool");
        Ok(id)
    }

    pub fn open_pool(&mut self, id: PoolId) -> Result<()> {
        let pool = self.pools.get_mut(&id).ok_or(GcError::NonExist)?;
        pool.opened += 1;
        trace!(pool = %id, refs = pool.opened, "opened pool");
        Ok(())
    }

    pub fn close_pool(&mut self, id: PoolId) -> Result<()> {
        let pool = self.pools.get_mut(&id).ok_or(GcError::NoHandle)?;
        let user_refs = pool.opened - u32::from(pool.is_attached());
        if user_refs == 0 {
            return Err(GcError::NoHandle);
        }
        pool.opened -= 1;
        if pool.opened == 0 && pool.is_dying() {
            self.pools.remove(&id);
            info!(pool = %id, "released destroyed pool");
        }
        Ok(())
    }

    /// Destroys the pool. Pending garbage is dropped with the pool; if users still hold it open
    /// it is only marked dying and the call fails with `Busy`.
    pub fn destroy_pool(&mut self, id: PoolId) -> Result<()> {
        let pool = self.pools.get_mut(&id).ok_or(GcError::NonExist)?;
        pool.kill();
        if pool.opened > 0 {
            return Err(GcError::Busy(format!("{} is still open", id)));
        }
        self.pools.remove(&id);
        info!(pool = %id, "destroyed pool");
        Ok(())
    }

    pub fn is_open(&self, id: PoolId) -> bool {
        self.pool(id).is_ok()
    }

    pub fn pool(&self, id: PoolId) -> Result<&Pool> {
        match self.pools.get(&id) {
            Some(pool) if pool.opened > 0 => Ok(pool),
            _ => Err(GcError::NoHandle),
        }
    }

    pub fn pool_mut(&mut self, id: PoolId) -> Result<&mut Pool> {
        match self.pools.get_mut(&id) {
            Some(pool) if pool.opened > 0 => Ok(pool),
            _ => Err(GcError::NoHandle),
        }
    }

    pub fn pool_is_idle(&self, id: PoolId) -> Result<bool> {
        Ok(self.pool(id)?.gc_is_idle())
    }

    /// Reclaims garbage of every attached pool, round robin, until `credits` are consumed or
    /// nothing is left. The remaining credits are written back.
    pub fn gc_run(&mut self, credits: &mut u32) -> Result<()> {
        let mut creds = *credits;
        if !(GC_CREDS_MIN..=GC_CREDS_MAX).contains(&creds) {
            error!(credits = creds, "invalid credits");
            return Err(GcError::Invalid(format!("credits {}", creds)));
        }
        if self.worklist.is_empty() {
            return Ok(());
        }

        let mut checked = 0;
        let mut rc = Ok(());
        while let Some(id) = self.worklist.front() {
            let pool = match self.pools.get_mut(&id) {
                Some(pool) => pool,
                None => panic!("{} on the worklist is not pinned", id),
            };
            trace!(pool = %id, credits = creds, "GC pool");

            let empty = match pool.reclaim(&mut creds) {
                Ok(empty) => empty,
                Err(e) => {
                    error!(pool = %id, error = %e, "GC pool failed");
                    rc = Err(e);
                    break;
                }
            };
            checked += 1;
            if empty {
                debug!(pool = %id, "deregister pool");
                pool.log_stats();
                pool.detach();
            } else {
                self.worklist.requeue(id);
            }
            if creds == 0 {
                break;
            }
        }
        debug!(checked, consumed = *credits - creds, total = *credits, "GC run done");
        *credits = creds;
        rc
    }

    /// Reclaims everything in tight rounds. Returns the consumed credits.
    pub fn gc_wait(&mut self) -> Result<u32> {
        let mut total = 0;
        loop {
            let mut creds = GC_CREDS_TIGHT;
            self.gc_run(&mut creds)?;
            total += GC_CREDS_TIGHT - creds;
            if creds != 0 {
                debug!(consumed = total, "GC wait done");
                return Ok(total);
            }
        }
    }

    /// Reclaims garbage of one open pool, see [Pool::gc_run_with_yield].
    pub fn gc_pool<F>(&mut self, id: PoolId, credits: u32, yield_fn: F) -> Result<u32>
    where
        F: FnMut() -> YieldHint,
    {
        self.pool_mut(id)?.gc_run_with_yield(credits, yield_fn)
    }
}
