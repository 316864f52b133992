//! Archive a directory to an object-storage container and prune backups that
//! have outlived their retention window.

pub mod app;
pub mod archive;
pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod retention;
pub mod storage;
pub mod upload;
