/// Minimum credits accepted by a single reclaim call.
pub const GC_CREDS_MIN: u32 = 1;
/// Credits per slice in slack mode.
pub const GC_CREDS_SLACK: u32 = 8;
/// Credits per slice in tight mode.
pub const GC_CREDS_TIGHT: u32 = 32;
/// Maximum credits accepted by a single reclaim call.
pub const GC_CREDS_MAX: u32 = 4096;

/// Default number of items per garbage bag.
///
/// A bag header is 64 bytes and every item consumes 16 bytes.
pub const GC_BAG_SIZE: u16 = 250 + 3 * 256;
pub const GC_BAG_HEADER_SIZE: usize = 64;
pub const GC_ITEM_SIZE: usize = 16;

/// Internal drain allotments for levels that only flatten their subtree.
pub const GC_DKEY_DRAIN_CREDS: u32 = 32;
pub const GC_OBJ_DRAIN_CREDS: u32 = 8;
pub const GC_CONT_DRAIN_CREDS: u32 = 1;

/// Default persistent pool size.
pub const DEFAULT_POOL_SIZE: usize = 256 * 1024 * 1024;
