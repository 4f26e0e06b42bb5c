//! Business services: import coordination, completion handling, retries,
//! and the adapters covering each external collaborator.

pub mod completion;
pub mod importer;
pub mod media_store;
pub mod publisher;
pub mod resend;
pub mod retry;
pub mod storage;
