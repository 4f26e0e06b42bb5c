//! Database access for atomhub

pub mod init;

pub use init::init_database;
