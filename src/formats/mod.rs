//! File formats understood by scanners and de-identification profiles.

pub mod header;

pub use header::{read_header, HeaderError, HeaderFile};
