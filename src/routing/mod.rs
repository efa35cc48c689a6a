//! Host-to-route table: resolution, replacement and retirement.

pub mod route;
pub mod table;

pub use route::{
    Algorithm, AliasParams, EmptyParams, ProxyParams, RedirectParams, Route, RouteParams,
    RouteParseError, SpinParams, StaticParams,
};
pub use table::RoutingTable;
