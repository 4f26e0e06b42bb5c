//! Message processors, one per inbound stream category

mod atom;
mod commission;
mod notification;
mod project;

pub use atom::AtomEventProcessor;
pub use commission::CommissionProcessor;
pub use notification::JobNotificationProcessor;
pub use project::ProjectProcessor;
