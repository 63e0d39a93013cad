pub mod price_source;
pub mod registry;

pub use price_source::{HttpPriceSource, PriceSource, Quote};
pub use registry::{registry_from_config, InstrumentRegistry, StaticRegistry, StoreRegistry};
