pub mod engine;
pub mod events;
pub mod observer;
pub mod ports;
pub mod projections;
pub mod session;
pub mod types;

pub use engine::*;
pub use events::*;
pub use observer::*;
pub use ports::*;
pub use projections::*;
pub use session::*;
pub use types::*;
