pub mod account;
pub mod admin;
pub mod purchase;
pub mod webhook;

pub use account::account_config;
pub use admin::admin_config;
pub use purchase::purchase_config;
pub use webhook::webhook_config;
