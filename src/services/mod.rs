pub mod account_service;
pub mod account_store;
pub mod auto_renewal_service;
pub mod entitlement_grantor;
pub mod idempotency_ledger;
pub mod notification_service;
pub mod purchase_finalizer;
pub mod purchase_service;
pub mod reconciliation_service;
pub mod referral_rewarder;

pub use account_service::*;
pub use account_store::*;
pub use auto_renewal_service::*;
pub use entitlement_grantor::*;
pub use idempotency_ledger::*;
pub use notification_service::*;
pub use purchase_finalizer::*;
pub use purchase_service::*;
pub use reconciliation_service::*;
pub use referral_rewarder::*;
