//! Host-facing event types.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them to a UI bus unchanged.

pub mod events;
