pub mod provisioning;
pub mod retry;

pub use provisioning::*;
pub use retry::*;
