//! Types published to the host.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON (the CLI prints them; a UI shell would emit them).

pub mod events;
