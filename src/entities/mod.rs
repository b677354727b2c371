pub mod accounts;
pub mod entitlements;
pub mod notification_log;
pub mod payments;
pub mod pending_purchases;
pub mod referral_rewards;

pub use accounts as account_entity;
pub use entitlements as entitlement_entity;
pub use notification_log as notification_log_entity;
pub use payments as payment_entity;
pub use pending_purchases as pending_purchase_entity;
pub use referral_rewards as referral_reward_entity;

pub use entitlements::EntitlementStatus;
pub use pending_purchases::{PurchaseFunding, PurchaseKind, PurchaseStatus};
