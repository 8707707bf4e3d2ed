pub mod broadcast;
pub mod build;
pub mod engine;
pub mod registry;
pub mod reply;
pub mod tell;
pub mod validate;

pub use broadcast::*;
pub use build::*;
pub use engine::*;
pub use registry::*;
pub use reply::*;
pub use tell::*;
pub use validate::*;
