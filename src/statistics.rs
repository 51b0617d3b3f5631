use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

/// Counters of reclaimed records.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct GcStat {
    pub conts: u64,
    pub objs: u64,
    pub dkeys: u64,
    pub akeys: u64,
    /// Single values released while draining akeys.
    pub singvs: u64,
    /// Extents released while draining akeys.
    pub recxs: u64,
}

impl GcStat {
    pub fn merge(&mut self, other: &GcStat) {
        self.conts += other.conts;
        self.objs += other.objs;
        self.dkeys += other.dkeys;
        self.akeys += other.akeys;
        self.singvs += other.singvs;
        self.recxs += other.recxs;
    }

    pub fn is_zero(&self) -> bool {
        *self == GcStat::default()
    }
}

impl std::fmt::Display for GcStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GC reclaimed:")?;
        writeln!(f, "  containers = {}", self.conts)?;
        writeln!(f, "  objects    = {}", self.objs)?;
        writeln!(f, "  dkeys      = {}", self.dkeys)?;
        writeln!(f, "  akeys      = {}", self.akeys)?;
        writeln!(f, "  singvs     = {}", self.singvs)?;
        writeln!(f, "  recxs      = {}", self.recxs)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct SliceDuration {
    pub last: Duration,
    pub max: Duration,
    pub total: Duration,
    pub count: u64,
}

/// Telemetry of one target. Shared by the pools of the target and read from anywhere.
#[derive(Default, Debug)]
pub struct GcMetrics {
    pub cont_del: AtomicU64,
    pub obj_del: AtomicU64,
    pub dkey_del: AtomicU64,
    pub akey_del: AtomicU64,
    pub ev_del: AtomicU64,
    pub sv_del: AtomicU64,
    pub tight_cnt: AtomicU64,
    pub slack_cnt: AtomicU64,
    duration: Mutex<SliceDuration>,
}

impl GcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_stat(&self, stat: &GcStat) {
        self.cont_del.fetch_add(stat.conts, Ordering::Relaxed);
        self.obj_del.fetch_add(stat.objs, Ordering::Relaxed);
        self.dkey_del.fetch_add(stat.dkeys, Ordering::Relaxed);
        self.akey_del.fetch_add(stat.akeys, Ordering::Relaxed);
        self.ev_del.fetch_add(stat.recxs, Ordering::Relaxed);
        self.sv_del.fetch_add(stat.singvs, Ordering::Relaxed);
    }

    pub(crate) fn record_slice(&self, tight: bool, elapsed: Duration) {
        if tight {
            self.tight_cnt.fetch_add(1, Ordering::Relaxed);
        } else {
            self.slack_cnt.fetch_add(1, Ordering::Relaxed);
        }
        let mut duration = self.duration.lock();
        duration.last = elapsed;
        duration.max = duration.max.max(elapsed);
        duration.total += elapsed;
        duration.count += 1;
    }

    pub fn slice_duration(&self) -> SliceDuration {
        *self.duration.lock()
    }

    pub fn tight_slices(&self) -> u64 {
        self.tight_cnt.load(Ordering::Relaxed)
    }

    pub fn slack_slices(&self) -> u64 {
        self.slack_cnt.load(Ordering::Relaxed)
    }

    /// Reclaim counters as a [GcStat].
    pub fn reclaimed(&self) -> GcStat {
        GcStat {
            conts: self.cont_del.load(Ordering::Relaxed),
            objs: self.obj_del.load(Ordering::Relaxed),
            dkeys: self.dkey_del.load(Ordering::Relaxed),
            akeys: self.akey_del.load(Ordering::Relaxed),
            singvs: self.sv_del.load(Ordering::Relaxed),
            recxs: self.ev_del.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_display() {
        let mut stat = GcStat::default();
        assert!(stat.is_zero());
        stat.merge(&GcStat {
            akeys: 3,
            singvs: 12,
            ..Default::default()
        });
        let text = stat.to_string();
        assert!(text.contains("akeys      = 3"));
        assert!(text.contains("singvs     = 12"));
    }

    #[test]
    fn metrics_slices() {
        let metrics = GcMetrics::new();
        metrics.record_slice(true, Duration::from_micros(5));
        metrics.record_slice(false, Duration::from_micros(9));
        assert_eq!(metrics.tight_slices(), 1);
        assert_eq!(metrics.slack_slices(), 1);
        let duration = metrics.slice_duration();
        assert_eq!(duration.count, 2);
        assert_eq!(duration.max, Duration::from_micros(9));
        assert_eq!(duration.total, Duration::from_micros(14));
    }
}
