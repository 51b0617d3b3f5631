//! Incremental garbage collector of a persistent-memory object store.
//!
//! Punched containers, objects and keys are queued as garbage items in persistent bins and
//! reclaimed later in small credit-bounded slices. Every step runs inside a persistent
//! transaction, so a restart never loses or frees an item twice.
//!
//! ```ignore
//! let mut pool = Pool::create(PoolId(1), Config::default())?;
//! pool.tx_begin()?;
//! pool.gc_add_item(None, GcType::Object, obj, 0)?;
//! pool.tx_end(Ok(()))?;
//! while !pool.gc_is_idle() {
//!     pool.gc_run(GC_CREDS_TIGHT)?;
//! }
//! ```

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            tracing::info!($($t)*);
        }
    };
}

pub mod bin;
pub mod container;
pub mod dtx;
pub mod error;
pub mod gc_type;
pub mod globals;
pub mod layout;
pub mod pool;
pub mod reclaim;
pub mod runtime;
pub mod statistics;
pub mod tree;
pub mod umem;


pub use container::ContHandle;
pub use error::{GcError, Result};
pub use gc_type::GcType;
pub use pool::{Pool, PoolId, YieldHint};
pub use runtime::GcRuntime;
pub use statistics::{GcMetrics, GcStat};
pub use umem::{Umem, UmemOff};

use globals::{
    DEFAULT_POOL_SIZE, GC_BAG_HEADER_SIZE, GC_BAG_SIZE, GC_CREDS_MAX, GC_CREDS_MIN,
    GC_CREDS_SLACK, GC_CREDS_TIGHT, GC_ITEM_SIZE,
};

/// Configuration of a pool and its collector.
#[derive(Clone, Debug)]
pub struct Config {
    /// Items per garbage bag.
    pub bag_size: u16,
    /// Credits of one slice in tight mode.
    pub tight_credits: u32,
    /// Credits of one slice in slack mode.
    pub slack_credits: u32,
    /// Bytes of persistent memory of a pool.
    pub pool_size: usize,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bag_size: GC_BAG_SIZE,
            tight_credits: GC_CREDS_TIGHT,
            slack_credits: GC_CREDS_SLACK,
            pool_size: DEFAULT_POOL_SIZE,
            verbose: false,
        }
    }
}

impl Config {
    pub fn with_bag_size(mut self, bag_size: u16) -> Self {
        self.bag_size = bag_size;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_slices(mut self, tight_credits: u32, slack_credits: u32) -> Self {
        self.tight_credits = tight_credits;
        self.slack_credits = slack_credits;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Persistent space a pool keeps back so that the collector can always queue garbage: one
    /// full bag for every credit of the largest reclaim call.
    pub fn reserved_space(&self) -> usize {
        (GC_BAG_HEADER_SIZE + self.bag_size as usize * GC_ITEM_SIZE) * GC_CREDS_MAX as usize
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.bag_size == 0 {
            return Err(GcError::Invalid("bag size must not be zero".into()));
        }
        if self.pool_size <= self.reserved_space() {
            return Err(GcError::Invalid(format!(
                "pool size {} does not cover {} bytes reserved for GC",
                self.pool_size,
                self.reserved_space()
            )));
        }
        let slices = GC_CREDS_MIN..=GC_CREDS_MAX;
        if !slices.contains(&self.tight_credits) || !slices.contains(&self.slack_credits) {
            return Err(GcError::Invalid(format!(
                "slice credits {}/{} out of range",
                self.tight_credits, self.slack_credits
            )));
        }
        Ok(())
    }
}
