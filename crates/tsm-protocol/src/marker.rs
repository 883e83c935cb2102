//! Stateless OSC 133 marker extraction.
//!
//! Shell-integration-aware shells emit out-of-band escape sequences to signal
//! prompt/command lifecycle boundaries:
//!
//! ```text
//! ESC ] 1 3 3 ; <code> [; data ...] BEL
//! ```
//!
//! Matching is anchored to the exact `ESC ] 133 ;` prefix, so a BEL inside
//! unrelated plain text is never treated as a terminator. Decoding operates
//! on whatever bytes it is given; a marker whose terminator has not arrived
//! yet is reported as a partial candidate so the caller can carry those bytes
//! into the next chunk.

use chrono::{DateTime, Utc};

/// The anchored marker prefix: `ESC ] 133 ;`.
const MARKER_PREFIX: &[u8] = b"\x1b]133;";

/// Marker terminator (BEL).
const MARKER_TERMINATOR: u8 = 0x07;

/// Lifecycle marker types.
///
/// Code letters follow the OSC 133 convention, plus two custom extensions
/// (`G`/`H`) for editor enter/exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// `A` - prompt is being drawn.
    PromptStart,
    /// `B` (or the `E` alternate) - command is about to execute.
    PreExec,
    /// `C` - execution started. Carries no command text; retained for
    /// protocol completeness.
    ExecStart,
    /// `D` - command finished; data field holds the exit code.
    ExecExit,
    /// `F` - alternate post-execution signal without exit detail.
    PostExec,
    /// `G` - editor started; data field holds the editor name.
    EditorStart,
    /// `H` - editor exited.
    EditorEnd,
}

impl MarkerKind {
    /// Maps a code letter to a marker kind. Unknown letters decode to `None`
    /// and the whole sequence is skipped.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'A' => Some(Self::PromptStart),
            b'B' | b'E' => Some(Self::PreExec),
            b'C' => Some(Self::ExecStart),
            b'D' => Some(Self::ExecExit),
            b'F' => Some(Self::PostExec),
            b'G' => Some(Self::EditorStart),
            b'H' => Some(Self::EditorEnd),
            _ => None,
        }
    }

    /// The wire code letter for this kind.
    pub fn code(&self) -> u8 {
        match self {
            Self::PromptStart => b'A',
            Self::PreExec => b'B',
            Self::ExecStart => b'C',
            Self::ExecExit => b'D',
            Self::PostExec => b'F',
            Self::EditorStart => b'G',
            Self::EditorEnd => b'H',
        }
    }
}

/// A decoded lifecycle marker.
///
/// Produced transiently by the decoder; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub kind: MarkerKind,
    /// First `;`-separated data field (exit code for `ExecExit`, editor name
    /// for `EditorStart`). `None` when the marker carries no data.
    pub data: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Extracts all markers from `data` in byte order.
///
/// Convenience wrapper over [`decode_chunk`] that discards partial-candidate
/// information; use it when chunk boundaries are known to be safe (tests,
/// whole captures).
pub fn decode_markers(data: &[u8]) -> Vec<Marker> {
    decode_chunk(data).0
}

/// Extracts all complete markers from `data` and reports a trailing partial
/// marker candidate.
///
/// Returns `(markers, partial_start)`. `partial_start` is the offset of a
/// trailing byte run that is a proper prefix of a marker (anchored prefix
/// seen, terminator not yet) - the caller should prepend `data[partial..]`
/// to the next chunk. Plain text is never reported as partial.
pub fn decode_chunk(data: &[u8]) -> (Vec<Marker>, Option<usize>) {
    let mut markers = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let Some(esc) = data[pos..].iter().position(|&b| b == 0x1b) else {
            break;
        };
        let start = pos + esc;
        let rest = &data[start..];

        if rest.len() < MARKER_PREFIX.len() {
            // Could be the head of a marker split across chunks.
            if MARKER_PREFIX.starts_with(rest) {
                return (markers, Some(start));
            }
            pos = start + 1;
            continue;
        }

        if &rest[..MARKER_PREFIX.len()] != MARKER_PREFIX {
            pos = start + 1;
            continue;
        }

        let body_start = MARKER_PREFIX.len();
        match rest[body_start..]
            .iter()
            .position(|&b| b == MARKER_TERMINATOR)
        {
            None => {
                // Anchored prefix with no terminator in this chunk.
                return (markers, Some(start));
            }
            Some(body_len) => {
                let body = &rest[body_start..body_start + body_len];
                if let Some(marker) = parse_body(body) {
                    markers.push(marker);
                }
                pos = start + body_start + body_len + 1;
            }
        }
    }

    (markers, None)
}

/// Parses the bytes between the prefix and the terminator: a one-letter code
/// optionally followed by `;`-separated data fields.
fn parse_body(body: &[u8]) -> Option<Marker> {
    let (&code, rest) = body.split_first()?;
    let kind = MarkerKind::from_code(code)?;

    let data = match rest.split_first() {
        Some((&b';', fields)) => {
            let first = fields
                .split(|&b| b == b';')
                .next()
                .unwrap_or_default();
            Some(String::from_utf8_lossy(first).into_owned())
        }
        _ => None,
    };

    Some(Marker {
        kind,
        data,
        timestamp: Utc::now(),
    })
}
