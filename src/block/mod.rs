//! Block-oriented helpers layered on the raw sector interface.
//!
//! One convenience lives here: the sector string helpers in [`strings`],
//! which store a NUL-terminated string per 512-byte sector.

pub mod strings;

pub use strings::SectorString;
