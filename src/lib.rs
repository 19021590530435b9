pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;
pub mod webhooks;
pub mod workspaces;

pub use billing::BillingService;
pub use error::{AppError, AppResult};
pub use workspaces::MembershipGuard;
