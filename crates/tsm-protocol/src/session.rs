//! Per-session decode state machine.
//!
//! A [`ProtocolSession`] consumes decoded markers (primary path) and raw
//! keystrokes (fallback path) and produces completed
//! [`CommandRecord`]s. It is pure state: the monitoring engine owns one per
//! session behind its per-session lock, so nothing here synchronizes.
//!
//! Normal marker cycle: `Idle -> InPrompt -> Executing -> Idle`. Two
//! orthogonal flags persist across the cycle: `in_editor` (set by the
//! editor marker extension) and `has_protocol_support` (sticky once any
//! marker has been observed on this stream).

use crate::marker::{decode_chunk, Marker, MarkerKind};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use tsm_core::{CommandRecord, SessionKey};

/// Maximum number of commands kept in per-session history.
pub const MAX_COMMAND_HISTORY: usize = 1000;

/// Number of history entries removed at once when the cap is exceeded.
/// Batch removal avoids a reallocation per appended command.
pub const HISTORY_EVICT_BATCH: usize = 100;

/// Upper bound on carried-over bytes for a marker split across chunks.
/// Anything longer was ordinary output containing a stray escape, not a
/// marker, and is dropped from the carry.
const MAX_CARRY: usize = 256;

/// Decode state for the normal marker cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for a prompt.
    Idle,
    /// In prompt, waiting for a command.
    InPrompt,
    /// Command executing.
    Executing,
}

/// Sub-state for ignoring escape sequences in the fallback input path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeState {
    None,
    /// Saw ESC, next byte decides.
    Escape,
    /// Saw ESC `[`; ignore until a byte in 0x40..=0x7E.
    Csi,
}

/// Command-boundary state for one terminal session.
#[derive(Debug)]
pub struct ProtocolSession {
    key: SessionKey,
    state: DecodeState,

    /// Fallback keystroke buffer (the command being typed).
    keystrokes: String,
    /// Bytes of an in-flight multi-byte character from the input stream.
    utf8_pending: Vec<u8>,
    escape: EscapeState,

    /// Command captured from input, waiting for markers to confirm it.
    pending_command: Option<String>,
    last_command: String,
    current_dir: String,
    command_start: Option<DateTime<Utc>>,

    has_protocol_support: bool,
    in_editor: bool,
    editor_name: String,

    /// Tail bytes of an incomplete marker awaiting the next output chunk.
    carry: Vec<u8>,

    next_sequence: u64,
    history: Vec<CommandRecord>,
}

impl ProtocolSession {
    /// Creates decode state for a freshly registered session.
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            state: DecodeState::Idle,
            keystrokes: String::new(),
            utf8_pending: Vec::new(),
            escape: EscapeState::None,
            pending_command: None,
            last_command: String::new(),
            current_dir: String::new(),
            command_start: None,
            has_protocol_support: false,
            in_editor: false,
            editor_name: String::new(),
            carry: Vec::new(),
            next_sequence: 1,
            history: Vec::with_capacity(100),
        }
    }

    // ========================================================================
    // Output path (markers)
    // ========================================================================

    /// Decodes one chunk of shell output and applies every marker in byte
    /// order, returning the commands completed by this chunk.
    ///
    /// Markers split across chunk boundaries are reassembled via a bounded
    /// carry buffer; the split tail is held until the terminator arrives.
    pub fn process_output(&mut self, data: &[u8]) -> Vec<CommandRecord> {
        let (markers, partial) = if self.carry.is_empty() {
            self.decode_with_carry(data)
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(data);
            self.decode_with_carry(&joined)
        };

        if partial {
            debug!(
                session = %self.key,
                carry_len = self.carry.len(),
                "holding incomplete marker tail for next chunk"
            );
        }

        let mut completed = Vec::new();
        for marker in &markers {
            if let Some(record) = self.apply_marker(marker) {
                completed.push(record);
            }
        }
        completed
    }

    /// Runs the chunk decoder and stores any bounded partial tail in the
    /// carry buffer. Returns the markers and whether a tail was kept.
    fn decode_with_carry(&mut self, data: &[u8]) -> (Vec<Marker>, bool) {
        let (markers, partial_start) = decode_chunk(data);
        match partial_start {
            Some(start) if data.len() - start <= MAX_CARRY => {
                self.carry = data[start..].to_vec();
                (markers, true)
            }
            Some(start) => {
                // Too long to be a marker; treat as plain output.
                debug!(
                    session = %self.key,
                    tail_len = data.len() - start,
                    "discarding over-long marker candidate"
                );
                self.carry.clear();
                (markers, false)
            }
            None => {
                self.carry.clear();
                (markers, false)
            }
        }
    }

    /// Applies a single marker, returning a completed command for
    /// `ExecExit`.
    ///
    /// Every marker makes protocol support sticky for the life of the
    /// session.
    pub fn apply_marker(&mut self, marker: &Marker) -> Option<CommandRecord> {
        self.has_protocol_support = true;

        match marker.kind {
            MarkerKind::PromptStart => {
                self.state = DecodeState::InPrompt;
                None
            }

            MarkerKind::PreExec => {
                self.state = DecodeState::Executing;
                self.command_start = Some(marker.timestamp);
                // Adopt the command captured from keystrokes, if any.
                if let Some(pending) = self.pending_command.take() {
                    self.last_command = pending;
                }
                debug!(
                    session = %self.key,
                    command = %self.last_command,
                    "pre-exec marker, command ready"
                );
                None
            }

            // Execution started; the command text is not carried on this
            // marker, so there is nothing to do until exit.
            MarkerKind::ExecStart => None,

            MarkerKind::ExecExit => Some(self.complete_command(marker)),

            MarkerKind::PostExec => {
                // Alternate exit signal without exit detail. Shells that only
                // emit this subset lose command-exit information.
                self.state = DecodeState::Idle;
                self.command_start = None;
                None
            }

            MarkerKind::EditorStart => {
                self.in_editor = true;
                self.editor_name = marker.data.clone().unwrap_or_default();
                // Editor keystrokes are never shell commands; discard any
                // partial capture.
                self.keystrokes.clear();
                self.utf8_pending.clear();
                self.pending_command = None;
                info!(session = %self.key, editor = %self.editor_name, "editor started");
                None
            }

            MarkerKind::EditorEnd => {
                self.in_editor = false;
                self.editor_name.clear();
                info!(session = %self.key, "editor exited");
                None
            }
        }
    }

    /// Resolves the pending command on an exit marker.
    ///
    /// Accepted in every state - some shells emit the exit marker late,
    /// after the next prompt has already been drawn.
    fn complete_command(&mut self, marker: &Marker) -> CommandRecord {
        let exit_code = match marker.data.as_deref() {
            None | Some("") => 0,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(session = %self.key, data = raw, "failed to parse exit code, assuming 0");
                0
            }),
        };

        let ended_at = marker.timestamp;
        let started_at = self.command_start.unwrap_or(ended_at);
        let duration = (ended_at - started_at).to_std().unwrap_or_default();

        let record = CommandRecord {
            sequence: self.next_sequence,
            command: self.last_command.clone(),
            pwd: self.current_dir.clone(),
            exit_code,
            started_at,
            ended_at,
            duration,
        };
        self.next_sequence += 1;
        self.push_history(record.clone());

        self.keystrokes.clear();
        self.utf8_pending.clear();
        self.state = DecodeState::Idle;
        self.command_start = None;

        info!(
            session = %self.key,
            command = %record.command,
            exit_code,
            duration_ms = record.duration.as_millis() as u64,
            "command completed"
        );

        record
    }

    fn push_history(&mut self, record: CommandRecord) {
        if self.history.len() >= MAX_COMMAND_HISTORY {
            self.history.drain(..HISTORY_EVICT_BATCH);
        }
        self.history.push(record);
    }

    // ========================================================================
    // Input path (fallback keystroke capture)
    // ========================================================================

    /// Consumes raw client keystrokes for fallback command capture.
    ///
    /// Returns the captured command when carriage return / newline commits a
    /// non-empty buffer. While the editor flag is set, all bytes are ignored
    /// outright.
    pub fn feed_input(&mut self, data: &[u8]) -> Option<String> {
        if self.in_editor {
            return None;
        }

        for &b in data {
            // Swallow ANSI escape/control sequences (e.g. arrow keys: ESC [ A)
            // so they never leak into the captured command text.
            match self.escape {
                EscapeState::Escape => {
                    self.escape = if b == b'[' {
                        EscapeState::Csi
                    } else {
                        // Non-CSI escape: ignore exactly this one byte.
                        EscapeState::None
                    };
                    continue;
                }
                EscapeState::Csi => {
                    if (0x40..=0x7E).contains(&b) {
                        self.escape = EscapeState::None;
                    }
                    continue;
                }
                EscapeState::None => {}
            }

            match b {
                0x1b => {
                    self.escape = EscapeState::Escape;
                }

                b'\r' | b'\n' => {
                    self.utf8_pending.clear();
                    if self.keystrokes.is_empty() {
                        continue;
                    }
                    let command = std::mem::take(&mut self.keystrokes);
                    self.last_command = command.clone();
                    self.pending_command = Some(command.clone());
                    self.command_start = Some(Utc::now());
                    info!(session = %self.key, command = %command, "command captured from input");
                    return Some(command);
                }

                0x7f | 0x08 => {
                    // Trim the last character, not the last byte.
                    self.utf8_pending.clear();
                    self.keystrokes.pop();
                }

                _ if b >= 0x20 => self.push_input_byte(b),

                _ => {}
            }
        }

        None
    }

    /// Appends one printable input byte, assembling multi-byte UTF-8
    /// characters so backspace can trim whole characters.
    fn push_input_byte(&mut self, b: u8) {
        if b < 0x80 && self.utf8_pending.is_empty() {
            self.keystrokes.push(b as char);
            return;
        }

        self.utf8_pending.push(b);
        match std::str::from_utf8(&self.utf8_pending) {
            Ok(s) => {
                self.keystrokes.push_str(s);
                self.utf8_pending.clear();
            }
            Err(e) => {
                if e.error_len().is_some() {
                    // Invalid sequence; drop it rather than corrupt the buffer.
                    self.utf8_pending.clear();
                }
                // Otherwise incomplete: wait for the remaining bytes.
            }
        }
    }

    // ========================================================================
    // Accessors / external sync
    // ========================================================================

    /// The session this state belongs to.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Current decode state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// The command currently being typed (fallback buffer).
    pub fn current_command(&self) -> &str {
        &self.keystrokes
    }

    /// The most recently captured or executed command.
    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    /// Command captured from input and not yet confirmed by markers.
    pub fn pending_command(&self) -> Option<&str> {
        self.pending_command.as_deref()
    }

    /// Clears the pending command (after a fallback completion resolved it).
    pub fn clear_pending_command(&mut self) {
        self.pending_command = None;
    }

    /// True once any marker has been observed on this stream.
    pub fn has_protocol_support(&self) -> bool {
        self.has_protocol_support
    }

    /// Whether the user is in an editor.
    pub fn in_editor(&self) -> bool {
        self.in_editor
    }

    /// Name of the active editor, empty when not in one.
    pub fn editor_name(&self) -> &str {
        &self.editor_name
    }

    /// Sets editor mode from a source other than markers (e.g. the typed
    /// command looked like `vim ...`). Entering discards partial capture,
    /// keeping the editor flag and keystroke suppression consistent.
    pub fn set_editor_mode(&mut self, in_editor: bool, editor_name: &str) {
        self.in_editor = in_editor;
        self.editor_name = if in_editor {
            editor_name.to_string()
        } else {
            String::new()
        };
        if in_editor {
            self.keystrokes.clear();
            self.utf8_pending.clear();
            self.pending_command = None;
        }
    }

    /// Working directory for this session, empty if unknown.
    pub fn current_dir(&self) -> &str {
        &self.current_dir
    }

    /// Updates the working directory (from registration or output scanning).
    pub fn set_current_dir(&mut self, dir: impl Into<String>) {
        self.current_dir = dir.into();
    }

    /// Whether the user is mid-command (non-empty keystroke buffer).
    pub fn is_typing(&self) -> bool {
        !self.keystrokes.is_empty()
    }

    /// Next sequence number a completed command would receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Advances the sequence counter for a command completed outside the
    /// marker path (fallback heuristic) and records it in history.
    pub fn record_external(&mut self, record: CommandRecord) {
        self.next_sequence = self.next_sequence.max(record.sequence + 1);
        self.last_command = record.command.clone();
        self.push_history(record);
    }

    /// The most recent `limit` history entries (all when `limit` is 0).
    pub fn history(&self, limit: usize) -> &[CommandRecord] {
        if limit == 0 || self.history.len() <= limit {
            &self.history
        } else {
            &self.history[self.history.len() - limit..]
        }
    }
}
