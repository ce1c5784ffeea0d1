//! # aviary-id
//!
//! Typed resource IDs for the aviary worker fleet.
//!
//! Every resource ID uses a prefixed format `{prefix}_{ulid}`, e.g.
//! `wkr_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix makes IDs self-describing
//! and prevents mixing resource types; the ULID payload keeps them
//! time-sortable and unique. Parsing is strict: the prefix must match the
//! type exactly and the payload must be a valid ULID.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export for consumers that need raw ULID operations.
pub use ulid::Ulid;
