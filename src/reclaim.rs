//! The reclaim loop.
//!
//! One call walks the garbage levels of the pool inside a single transaction. The cursor starts
//! at the akey level of the first container in the round robin list (or of the pool if no
//! container has garbage) and moves up a level whenever a bin runs empty. A drained container is
//! dropped for the next one; once the pool bins are empty up to the container level the pool has
//! nothing left to reclaim.
use tracing::{debug, error, trace};

use crate::{
    bin::{self, BinRef, Scope},
    error::Result,
    gc_type::{DrainOutcome, GcCtx, GcType},
    pool::Pool,
    statistics::GcStat,
    umem::UmemOff,
};

impl Pool {
    /// Reclaims garbage until `credits` are consumed or there is nothing left. Returns true if
    /// the pool has no garbage. On error nothing is changed, `credits` included.
    pub(crate) fn reclaim(&mut self, credits: &mut u32) -> Result<bool> {
        if self.dying {
            return Ok(true);
        }

        let saved = self.gc_conts.clone();
        let mut cont = self.gc_conts.pop();

        if let Err(e) = self.umem.tx_begin() {
            error!(pool = %self.id, error = %e, "failed to start GC transaction");
            self.gc_conts = saved;
            return Err(e);
        }

        let mut creds = *credits;
        let mut stat = GcStat::default();
        let res = self.reclaim_loop(&mut cont, &mut creds, &mut stat);
        debug!(
            pool = %self.id,
            origin = *credits,
            current = creds,
            ok = res.is_ok(),
            "GC slice done"
        );

        let rc = self
            .umem
            .tx_end(res.as_ref().map(|_| ()).map_err(Clone::clone));
        if let Err(e) = rc {
            error!(pool = %self.id, error = %e, "GC transaction aborted");
            self.gc_conts = saved;
            return Err(e);
        }

        *credits = creds;
        self.update_stats(&stat);
        if let Some(cont) = cont {
            // not drained yet, give the other containers a turn first
            self.gc_conts.push(cont);
        }
        res
    }

    fn reclaim_loop(
        &mut self,
        cont: &mut Option<UmemOff>,
        creds: &mut u32,
        stat: &mut GcStat,
    ) -> Result<bool> {
        let mut ty = GcType::Akey;

        while *creds > 0 {
            let scope = match *cont {
                Some(df) => Scope::Container(df),
                None => Scope::Pool,
            };
            trace!(ty = %ty, scope = ?scope, credits = *creds, "GC step");

            let item = match bin::peek_item(&self.umem, BinRef::new(self.df, scope, ty)) {
                Some(item) => item,
                None => {
                    match (scope, ty) {
                        (Scope::Container(df), GcType::Object) => {
                            trace!(cont = %df, "container objects reclaimed");
                            *cont = self.gc_conts.pop();
                            ty = GcType::Akey;
                        }
                        (Scope::Pool, GcType::Container) => {
                            trace!(pool = %self.id, "nothing to reclaim");
                            return Ok(true);
                        }
                        _ => match ty.parent() {
                            Some(parent) => ty = parent,
                            None => unreachable!("no level above {}", ty),
                        },
                    }
                    continue;
                }
            };

            let mut ctx = GcCtx {
                umem: &mut self.umem,
                pool_df: self.df,
                scope,
                stat: &mut *stat,
            };
            match ty.drain(&mut ctx, &item, creds)? {
                DrainOutcome::HandedOff => {
                    // container bags now sit in the pool bins, start over from akeys
                    ty = GcType::Akey;
                    continue;
                }
                DrainOutcome::Drained { empty } => {
                    if empty && *creds > 0 {
                        ty.free_item(&mut ctx, item)?;
                        *creds -= 1;
                    }
                }
            }
            trace!(ty = %ty, credits = *creds, "GC step done");

            // akeys hold most of the space, stay there; otherwise the drain just flattened
            // entries into the finer level
            if let Some(child) = ty.child() {
                ty = child;
            }
        }
        Ok(false)
    }

    /// Folds the counters of one reclaim call into the pool totals and telemetry.
    fn update_stats(&mut self, stat: &GcStat) {
        if let Some(metrics) = &self.metrics {
            metrics.record_stat(stat);
        }
        self.stat.merge(stat);
    }
}
