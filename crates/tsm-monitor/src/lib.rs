//! TSM Monitor - the terminal session monitoring engine
//!
//! Sits between a sandboxed shell's byte stream and a browser client's byte
//! stream, detects command boundaries via OSC 133 markers (with a heuristic
//! fallback), and fans completed commands out to an external analysis
//! pipeline without ever stalling interactive I/O.
//!
//! - [`registry`] - live connection handles per session (stale-tab takeover,
//!   forced teardown)
//! - [`monitor`] - per-session monitoring state and the input/output
//!   processing paths
//! - [`dispatcher`] - bounded job queue + worker pool calling the analysis
//!   service
//! - [`writer`] - dual-path output writer: synchronous to the client,
//!   mirrored asynchronously into the monitor
//!
//! # Architecture
//!
//! ```text
//! client keystrokes ──▶ TerminalMonitor::process_input ──▶ SessionState
//!                                                            (fallback capture)
//! shell output ──▶ DualPathWriter ──▶ client sink (sync)
//!                        │
//!                        └─▶ mirror queue ──▶ TerminalMonitor::process_output
//!                                                │ marker decode
//!                                                ▼
//!                                          CommandRecord ──▶ AnalysisDispatcher
//!                                                                │ worker pool
//!                                                                ▼
//!                                                        AnalysisService ──▶ sidebar channel
//! ```
//!
//! # Concurrency
//!
//! Lock order is table -> session, never the reverse, and no lock is held
//! across a call into the analysis service. The mirror queue and the job
//! queue are the only cross-task handoffs; both are bounded and non-blocking
//! for producers (overflow drops a unit of work and logs).
//!
//! All production code follows the panic-free policy: no `.unwrap()`,
//! `.expect()`, `panic!()`, `unreachable!()`, `todo!()` outside of tests.

pub mod config;
pub mod dispatcher;
pub mod heuristics;
pub mod monitor;
pub mod registry;
pub mod writer;

pub use config::MonitorConfig;
pub use dispatcher::AnalysisDispatcher;
pub use monitor::TerminalMonitor;
pub use registry::{SessionRegistry, TerminalConnection};
pub use writer::{ClientSink, DualPathWriter};
