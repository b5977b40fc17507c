//! bulk-import - bulk filesystem import through persistent work queues.
//!
//! A source folder (or zip archive) is walked against a template that maps
//! directory levels to container labels. The resulting items are uploaded by
//! workers that claim tasks from database-backed queues, so an import can be
//! shared between processes and resumed after a crash.

pub mod cli;
pub mod config;
pub mod deid;
pub mod formats;
pub mod importer;
pub mod models;
pub mod repository;
pub mod scanners;
pub mod schema;
pub mod template;
pub mod upload;
pub mod walker;
