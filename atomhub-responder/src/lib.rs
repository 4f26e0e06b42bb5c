//! Integration hub reconciling the upload event stream, the
//! project/commission topic broker and the job-completion feed into an
//! idempotent media-ingest workflow.

pub mod bootstrap;
pub mod db;
pub mod error;
pub mod messages;
pub mod processors;
pub mod router;
pub mod services;
pub mod worker;
