//! Small support structures shared across the framework.

pub mod cyclic;
pub mod ids;
pub mod lru;
pub mod retry;
pub mod static_list;
pub mod timing;

pub use cyclic::CyclicCursor;
pub use ids::{ConnectionIds, TransactionIds};
pub use lru::LruCache;
pub use retry::{RetryError, RetryPolicy};
pub use static_list::{ListError, StaticList};
pub use timing::TimeUsed;
