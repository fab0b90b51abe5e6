pub mod audit;
pub mod db;
pub mod models;
mod sessions;
mod tables;
mod users;

pub use db::{Database, DatabaseError};
pub use sessions::{RevokeOutcome, RotationOutcome};
pub use tables::*;
pub use users::CredentialChange;
