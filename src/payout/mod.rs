pub mod claim;
pub mod models;

pub use claim::ClaimManager;
pub use models::{DataAnomaly, PayoutRecord, RecipientBatch, PENDING};
