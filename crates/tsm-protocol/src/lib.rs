//! TSM Protocol - OSC 133 shell-integration decoding
//!
//! This crate owns the wire-level half of the monitoring engine:
//!
//! - [`marker`] - stateless extraction of OSC 133 lifecycle markers from
//!   arbitrary byte chunks of shell output
//! - [`session`] - the per-session decode state machine that turns markers
//!   (or, for shells without integration, raw keystrokes) into completed
//!   [`tsm_core::CommandRecord`]s
//!
//! Everything here is pure state: no locks, no I/O, no tasks. The monitoring
//! engine embeds a [`session::ProtocolSession`] under its per-session lock.

pub mod marker;
pub mod session;

pub use marker::{decode_chunk, decode_markers, Marker, MarkerKind};
pub use session::{
    DecodeState, ProtocolSession, HISTORY_EVICT_BATCH, MAX_COMMAND_HISTORY,
};
