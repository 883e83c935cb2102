//! The seam to the external analysis pipeline.
//!
//! The engine does not interpret analysis semantics beyond the silent flag;
//! it builds an [`AnalysisRequest`] per completed command, streams back
//! [`AnalysisResponse`] chunks, and forwards non-silent chunks toward the
//! sidebar. Delivery is best-effort throughout.

use crate::error::AnalysisError;
use crate::session::{CommandRecord, SessionKey};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

// ============================================================================
// Request / Signal
// ============================================================================

/// A completed command plus context, handed to the analysis service.
///
/// Immutable once built; the output snapshot is taken under the session lock
/// before the job is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// The session this command ran in.
    pub key: SessionKey,

    /// The completed command.
    pub record: CommandRecord,

    /// Snapshot of collected output at completion time (may be empty when
    /// the command was resolved purely from protocol markers).
    pub output: String,

    /// Whether this session's shell has emitted protocol markers.
    pub has_protocol_support: bool,
}

/// Transient session state pushed to the collaborator signal sink.
///
/// Fire-and-forget: transmission failures are logged by the service
/// implementation and never propagated back into the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSignal {
    /// Typing state changed (user started/stopped typing).
    pub is_typing: Option<bool>,

    /// Editor-mode state changed.
    pub in_editor: Option<bool>,

    /// Active editor name, when entering editor mode.
    pub editor_name: Option<String>,
}

impl SessionSignal {
    /// A typing-only signal.
    pub fn typing(is_typing: bool) -> Self {
        Self {
            is_typing: Some(is_typing),
            ..Self::default()
        }
    }

    /// An editor-mode signal.
    pub fn editor(in_editor: bool, editor_name: Option<String>) -> Self {
        Self {
            in_editor: Some(in_editor),
            editor_name,
            ..Self::default()
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// One chunk of the analysis response stream.
///
/// Modeled as a sum type so the forwarding path handles every variant
/// exhaustively at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisResponse {
    /// Rule/pattern-based response.
    Pattern {
        content: String,
        /// The rule that matched.
        rule: String,
    },

    /// Model-generated response.
    Llm {
        content: String,
        #[serde(default)]
        tools_used: Vec<String>,
    },

    /// High-priority warning for the user.
    Alert { content: String },

    /// Error reported by the pipeline itself.
    Error { message: String },

    /// Internal response that must not be surfaced to the user.
    Silent,
}

impl AnalysisResponse {
    /// Returns true if this chunk must be suppressed from the sidebar.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Silent)
    }

    /// Stable variant name, used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pattern { .. } => "pattern",
            Self::Llm { .. } => "llm",
            Self::Alert { .. } => "alert",
            Self::Error { .. } => "error",
            Self::Silent => "silent",
        }
    }

    /// User-visible content, if any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Pattern { content, .. } | Self::Llm { content, .. } | Self::Alert { content } => {
                Some(content)
            }
            Self::Error { message } => Some(message),
            Self::Silent => None,
        }
    }
}

/// A non-silent response chunk addressed to one session's sidebar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidebarMessage {
    pub key: SessionKey,
    pub response: AnalysisResponse,
}

// ============================================================================
// Service trait
// ============================================================================

/// Abstract analysis pipeline consumed by the dispatcher.
///
/// `process` returns an asynchronous, possibly unbounded sequence of response
/// chunks for one job. A failing or unreachable backend should produce an
/// erroring (or empty) stream; the engine logs and moves on.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Processes one completed command, streaming response chunks.
    fn process(&self, request: AnalysisRequest)
        -> BoxStream<'static, Result<AnalysisResponse, AnalysisError>>;

    /// Fire-and-forget notification of typing/editor transitions.
    async fn update_signal(&self, key: &SessionKey, signal: SessionSignal);
}
