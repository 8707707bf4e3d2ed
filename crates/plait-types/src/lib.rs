pub mod error;
pub mod plan;
pub mod stream;

pub use error::*;
pub use plan::*;
pub use stream::*;
