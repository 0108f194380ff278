// Settlement bookkeeping: audit fence, settled-state flip, stale claim recovery
pub mod audit;
pub mod recorder;
pub mod recovery;

pub use audit::AuditLog;
pub use recorder::SettlementRecorder;
pub use recovery::StaleClaimRecovery;
