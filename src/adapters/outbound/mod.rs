pub mod logging;
pub mod path_providers;
pub mod postgres;

pub use logging::*;
pub use path_providers::*;
pub use postgres::*;
