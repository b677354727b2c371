pub mod account;
pub mod common;
pub mod finalization;
pub mod pagination;
pub mod purchase;

pub use account::*;
pub use common::*;
pub use finalization::*;
pub use pagination::*;
pub use purchase::*;
