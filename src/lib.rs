//! Aether — trust and safety control plane for an autonomous agent runtime.
//!
//! Decides what self-generated code may run and what must stop: signed
//! skills, a policy gate in front of every sensitive action, a durable kill
//! switch, a hash-chained audit log, and a heartbeat that keeps checking.
//!
//! See `DESIGN.md` for the architecture and its grounding.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod control;
pub mod error;
pub mod gate;
pub mod heartbeat;
pub mod kill_switch;
pub mod logging;
pub mod storage;
pub mod trust;
