pub mod code_generator;
pub mod secrets;
pub mod time;

pub use code_generator::{auto_renewal_ref, generate_credential_id, generate_purchase_ref};
pub use secrets::secret_matches;
