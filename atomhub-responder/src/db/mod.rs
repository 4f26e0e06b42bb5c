//! Database query modules, one per table

pub mod deferred;
pub mod import_jobs;
pub mod projects;
