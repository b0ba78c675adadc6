pub use builder::{
    ChainKey, ChainLeg, ChainPayload, ChainState, OptionChainBuilder, SubscriptionControl,
    WindowChange,
};
pub use catalog::{InstrumentCatalog, StaticCatalog};
pub use registry::ChainRegistry;

/// Per (symbol, expiry) ATM window maintenance and chain payload assembly.
pub mod builder;

/// Listed option contract sources.
pub mod catalog;

/// Singleton-per-key [`OptionChainBuilder`] registry.
pub mod registry;
