pub mod memory;
pub mod stats;

pub use memory::SessionCache;
pub use stats::{CacheStats, CacheStatsSnapshot};
