pub mod error;
pub mod git;
pub mod paths;
pub mod store;

pub use error::*;
pub use git::*;
pub use paths::*;
pub use store::*;
