pub mod logger;
pub mod route_tracking;

pub use logger::*;
pub use route_tracking::*;
