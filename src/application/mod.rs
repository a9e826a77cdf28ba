pub mod route_tracking_service;

pub use route_tracking_service::*;
