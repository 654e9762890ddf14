#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;


pub use self::index::{Controller, ControllerMetrics, Index, IndexMetrics, SharedIndex, Update};

/// Set when the router serves a route; cleared with a reason when the route
/// is rejected.
pub const ADMITTED: &str = "Admitted";

/// Set when a route uses configuration the router will stop supporting.
pub const DEPRECATED: &str = "Deprecated";

/// Set when a route will not be served after the router is upgraded.
pub const UNSERVABLE_IN_FUTURE_VERSIONS: &str = "UnservableInFutureVersions";
