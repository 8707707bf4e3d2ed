pub mod logging;
pub mod supervisor;

pub use logging::*;
pub use supervisor::*;
