pub mod auth;
pub mod nonce;
pub mod validation;

pub use auth::{AdminDirectory, Capability, Principal};
pub use nonce::{MIGRATE_ACTION, NonceIssuer};
pub use validation::InputValidator;
