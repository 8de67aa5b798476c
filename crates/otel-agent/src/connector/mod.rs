//! Connectors: the exporting end of one pipeline and the receiving end of
//! others.

pub mod count;
pub mod forward;

pub use count::{CountConfig, CountConnectorFactory, MetricInfo};
pub use forward::ForwardConnectorFactory;
