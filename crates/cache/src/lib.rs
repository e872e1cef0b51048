pub mod facade;
pub mod memory_cache;
pub mod navigation;
pub mod prefetch;
pub mod reliability;
pub mod writer;

pub use facade::SelectorCache;
pub use memory_cache::MemoryCache;
pub use navigation::NavigationModel;
pub use prefetch::PrefetchQueue;
pub use reliability::FailureOutcome;
pub use writer::{StoreOp, StoreWriter};
