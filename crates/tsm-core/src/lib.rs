//! TSM Core - Shared types for sandboxed terminal session monitoring
//!
//! This crate provides the domain types shared between the protocol layer
//! (`tsm-protocol`) and the monitoring engine (`tsm-monitor`):
//!
//! - [`SessionKey`] / [`CommandRecord`] - session identity and completed commands
//! - [`RingBuffer`] - bounded overwrite-oldest output capture
//! - [`AnalysisService`] / [`AnalysisResponse`] - the seam to the external
//!   analysis pipeline
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()` outside of tests.

pub mod analysis;
pub mod error;
pub mod ring;
pub mod session;

// Re-exports for convenience
pub use analysis::{
    AnalysisRequest, AnalysisResponse, AnalysisService, SessionSignal, SidebarMessage,
};
pub use error::{AnalysisError, DomainError, DomainResult};
pub use ring::RingBuffer;
pub use session::{CommandRecord, SessionKey};
