//! Per-session monitoring state and the input/output processing paths.
//!
//! [`TerminalMonitor`] owns the session table. Each session's state sits
//! behind its own lock; callers take the table lock only long enough to
//! clone the session handle. Signals and analysis jobs are emitted after the
//! session guard is dropped, so no lock is ever held across a call into the
//! analysis service.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tsm_core::{
    AnalysisRequest, AnalysisService, CommandRecord, DomainError, DomainResult, RingBuffer,
    SessionKey, SessionSignal, SidebarMessage,
};
use tsm_protocol::ProtocolSession;

use crate::config::MonitorConfig;
use crate::dispatcher::{AnalysisDispatcher, AnalysisJob};
use crate::heuristics;

/// Everything the engine tracks for one live session.
struct SessionState {
    protocol: ProtocolSession,
    shell_id: String,
    last_command: String,
    command_count: u64,
    is_typing: bool,

    /// True while fallback output collection is active for a pending command.
    is_collecting: bool,
    output: RingBuffer,
    /// Monotonic start of the current fallback collection window.
    fallback_started: Option<Instant>,
    /// Wall-clock start, used for the record timestamps.
    fallback_started_wall: Option<DateTime<Utc>>,

    last_activity: DateTime<Utc>,
    /// Cancels this session's queued/streaming analysis jobs on teardown.
    cancel: CancellationToken,
}

impl SessionState {
    fn new(key: SessionKey, workdir: &str, shell_id: &str, config: &MonitorConfig) -> Self {
        let mut protocol = ProtocolSession::new(key);
        protocol.set_current_dir(workdir);
        Self {
            protocol,
            shell_id: shell_id.to_string(),
            last_command: String::new(),
            command_count: 0,
            is_typing: false,
            is_collecting: false,
            output: RingBuffer::new(config.output_buffer_capacity),
            fallback_started: None,
            fallback_started_wall: None,
            last_activity: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    fn reset_collection(&mut self) {
        self.is_collecting = false;
        self.fallback_started = None;
        self.fallback_started_wall = None;
        self.protocol.clear_pending_command();
    }
}

type SessionHandle = Arc<Mutex<SessionState>>;

/// The monitoring engine: session table, analysis dispatch, and the two
/// processing paths (client input, shell output).
pub struct TerminalMonitor {
    sessions: RwLock<HashMap<SessionKey, SessionHandle>>,
    service: Option<Arc<dyn AnalysisService>>,
    dispatcher: AnalysisDispatcher,
    config: MonitorConfig,
}

impl TerminalMonitor {
    /// Creates the engine and its analysis worker pool. Non-silent analysis
    /// responses are forwarded to `sidebar_tx`.
    pub fn new(
        service: Option<Arc<dyn AnalysisService>>,
        sidebar_tx: mpsc::Sender<SidebarMessage>,
        config: MonitorConfig,
    ) -> Self {
        let dispatcher = AnalysisDispatcher::new(service.clone(), sidebar_tx, &config);
        Self {
            sessions: RwLock::new(HashMap::new()),
            service,
            dispatcher,
            config,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Adds a session to the table. Registering an existing key resets its
    /// monitoring state.
    pub async fn register_session(
        &self,
        user_id: &str,
        session_id: &str,
        shell_id: &str,
        workdir: &str,
    ) {
        let key = SessionKey::new(user_id, session_id);
        let state = SessionState::new(key.clone(), workdir, shell_id, &self.config);
        let mut sessions = self.sessions.write().await;
        sessions.insert(key.clone(), Arc::new(Mutex::new(state)));
        info!(session = %key, shell_id, workdir, "monitoring session registered");
    }

    /// Removes a session and cancels its in-flight analysis jobs.
    pub async fn unregister_session(&self, key: &SessionKey) -> DomainResult<()> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(key)
        };
        let Some(handle) = removed else {
            return Err(DomainError::SessionNotFound { key: key.clone() });
        };
        let state = handle.lock().await;
        state.cancel.cancel();
        info!(session = %key, commands = state.command_count, "monitoring session removed");
        Ok(())
    }

    /// Number of monitored sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stops the analysis dispatcher, draining queued jobs.
    pub async fn stop(&self) {
        self.dispatcher.stop().await;
    }

    async fn session(&self, key: &SessionKey) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(key).cloned()
    }

    // ========================================================================
    // Input path
    // ========================================================================

    /// Processes raw client keystrokes for one session.
    ///
    /// Feeds the fallback capture buffer, flips the typing signal on
    /// transitions, and on a committed command decides between editor entry
    /// (heuristic) and fallback output collection.
    pub async fn process_input(&self, key: &SessionKey, data: &[u8]) {
        let Some(handle) = self.session(key).await else {
            return;
        };

        let mut signals = Vec::new();
        {
            let mut state = handle.lock().await;
            state.last_activity = Utc::now();

            let committed = state.protocol.feed_input(data);

            let typing = state.protocol.is_typing();
            if typing != state.is_typing {
                state.is_typing = typing;
                signals.push(SessionSignal::typing(typing));
            }

            if let Some(command) = committed {
                if let Some(editor) = heuristics::detect_editor_command(&command) {
                    let editor = editor.to_string();
                    debug!(session = %key, editor = %editor, "editor launch detected from input");
                    state.protocol.set_editor_mode(true, &editor);
                    state.reset_collection();
                    signals.push(SessionSignal::editor(true, Some(editor)));
                } else {
                    // Start the fallback collection window; markers, if the
                    // shell emits them, will preempt it.
                    state.is_collecting = true;
                    state.fallback_started = Some(Instant::now());
                    state.fallback_started_wall = Some(Utc::now());
                    state.output.clear();
                }
            }
        }

        self.emit_signals(key, signals).await;
    }

    // ========================================================================
    // Output path
    // ========================================================================

    /// Processes one mirrored chunk of shell output for one session.
    ///
    /// Marker decoding runs first; completed commands become analysis jobs.
    /// When no markers resolve the pending command, the fallback heuristics
    /// (timeouts, prompt shapes) decide completion instead.
    pub async fn process_output(&self, key: &SessionKey, data: &[u8]) {
        let Some(handle) = self.session(key).await else {
            return;
        };

        let mut signals = Vec::new();
        let mut jobs = Vec::new();
        {
            let mut state = handle.lock().await;
            state.last_activity = Utc::now();

            let was_in_editor = state.protocol.in_editor();
            let records = state.protocol.process_output(data);
            let in_editor = state.protocol.in_editor();

            if in_editor != was_in_editor {
                let name = (!state.protocol.editor_name().is_empty())
                    .then(|| state.protocol.editor_name().to_string());
                signals.push(SessionSignal::editor(in_editor, name));
            }

            if in_editor {
                if !records.is_empty() {
                    // An exit marker landing while in editor mode is the
                    // editor command itself finishing: the editor quit. The
                    // record stays in history but is never analyzed.
                    state.protocol.set_editor_mode(false, "");
                    signals.push(SessionSignal::editor(false, None));
                    state.output.clear();
                    state.reset_collection();
                } else if !state.protocol.has_protocol_support()
                    && heuristics::detect_prompt(data)
                {
                    // Heuristically entered editors have no end marker; a
                    // prompt reappearing means the editor exited.
                    state.protocol.set_editor_mode(false, "");
                    signals.push(SessionSignal::editor(false, None));
                }
            } else if !records.is_empty() {
                for record in records {
                    self.finish_command(&mut state, record, &mut signals, &mut jobs);
                }
                state.output.clear();
                state.reset_collection();
            } else if state.is_collecting
                && state.protocol.pending_command().is_some()
                && !state.protocol.has_protocol_support()
            {
                state.output.write(data);
                if let Some(record) = self.check_fallback_completion(&mut state) {
                    state.protocol.record_external(record.clone());
                    self.finish_command(&mut state, record, &mut signals, &mut jobs);
                    state.output.clear();
                    state.reset_collection();
                }
            }

            if !state.protocol.in_editor() {
                self.track_workdir(&mut state, data);
            }
        }

        self.emit_signals(key, signals).await;
        for job in jobs {
            if self.dispatcher.submit(job).is_err() {
                debug!(session = %key, "analysis job dropped: engine stopped");
            }
        }
    }

    /// Applies one completed command to session state and queues its
    /// analysis job. Must run under the session lock; emission happens after.
    fn finish_command(
        &self,
        state: &mut SessionState,
        record: CommandRecord,
        signals: &mut Vec<SessionSignal>,
        jobs: &mut Vec<AnalysisJob>,
    ) {
        state.last_command = record.command.clone();
        state.command_count += 1;
        if state.is_typing {
            state.is_typing = false;
            signals.push(SessionSignal::typing(false));
        }

        if self.service.is_some() {
            let output = if state.is_collecting {
                state.output.to_string_lossy()
            } else {
                String::new()
            };
            let request = AnalysisRequest {
                key: state.protocol.key().clone(),
                record,
                output,
                has_protocol_support: state.protocol.has_protocol_support(),
            };
            jobs.push(AnalysisJob::new(request, state.cancel.clone()));
        }
    }

    /// Decides whether the pending fallback command is finished.
    ///
    /// Completion requires any of: soft timeout with some output observed,
    /// hard timeout, or a prompt shape at the end of collected output. The
    /// exit code is inferred from error phrases in the output.
    fn check_fallback_completion(&self, state: &mut SessionState) -> Option<CommandRecord> {
        let started = state.fallback_started?;
        let command = state.protocol.pending_command()?.to_string();

        let elapsed = started.elapsed();
        let snapshot = state.output.to_vec();
        let has_output = !snapshot.is_empty();

        let soft_expired = has_output && elapsed >= self.config.fallback_soft_timeout;
        let hard_expired = elapsed >= self.config.fallback_hard_timeout;
        let prompt_drawn = has_output && heuristics::detect_prompt(&snapshot);

        if !(soft_expired || hard_expired || prompt_drawn) {
            return None;
        }

        let ended_at = Utc::now();
        let started_at = state.fallback_started_wall.unwrap_or(ended_at);
        let record = CommandRecord {
            sequence: state.protocol.next_sequence(),
            command,
            pwd: state.protocol.current_dir().to_string(),
            exit_code: heuristics::infer_exit_code(&snapshot),
            started_at,
            ended_at,
            duration: elapsed,
        };
        info!(
            session = %state.protocol.key(),
            command = %record.command,
            exit_code = record.exit_code,
            prompt_drawn,
            "command completed via fallback heuristics"
        );
        Some(record)
    }

    /// Keeps the session working directory roughly in sync by scanning
    /// output for echoed `cd` targets and bare `pwd` lines.
    fn track_workdir(&self, state: &mut SessionState, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        if let Some(target) = heuristics::extract_cd_target(&text) {
            if target.starts_with('/') {
                state.protocol.set_current_dir(target);
                return;
            }
        }
        if let Some(pwd) = heuristics::extract_pwd_line(&text) {
            state.protocol.set_current_dir(pwd);
        }
    }

    async fn emit_signals(&self, key: &SessionKey, signals: Vec<SessionSignal>) {
        let Some(service) = &self.service else {
            return;
        };
        for signal in signals {
            service.update_signal(key, signal).await;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether the session is currently in an editor.
    pub async fn is_in_editor_mode(&self, key: &SessionKey) -> bool {
        match self.session(key).await {
            Some(handle) => handle.lock().await.protocol.in_editor(),
            None => false,
        }
    }

    /// The active editor name, if the session is in one.
    pub async fn get_editor_name(&self, key: &SessionKey) -> Option<String> {
        let handle = self.session(key).await?;
        let state = handle.lock().await;
        let name = state.protocol.editor_name();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Whether the user is mid-keystroke on a command.
    pub async fn is_typing(&self, key: &SessionKey) -> bool {
        match self.session(key).await {
            Some(handle) => handle.lock().await.is_typing,
            None => false,
        }
    }

    /// Overrides the typing state from an external source (e.g. a client
    /// heartbeat) and pushes the transition signal.
    pub async fn update_typing_status(&self, key: &SessionKey, typing: bool) {
        let Some(handle) = self.session(key).await else {
            return;
        };
        let changed = {
            let mut state = handle.lock().await;
            let changed = state.is_typing != typing;
            state.is_typing = typing;
            changed
        };
        if changed {
            self.emit_signals(key, vec![SessionSignal::typing(typing)]).await;
        }
    }

    /// The most recently completed command, if any.
    pub async fn get_last_command(&self, key: &SessionKey) -> Option<String> {
        let handle = self.session(key).await?;
        let state = handle.lock().await;
        (!state.last_command.is_empty()).then(|| state.last_command.clone())
    }

    /// The command currently being typed (fallback capture buffer).
    pub async fn get_current_command(&self, key: &SessionKey) -> Option<String> {
        let handle = self.session(key).await?;
        let state = handle.lock().await;
        let current = state.protocol.current_command();
        (!current.is_empty()).then(|| current.to_string())
    }

    /// The most recent `limit` completed commands (all when `limit` is 0).
    pub async fn get_command_history(&self, key: &SessionKey, limit: usize) -> Vec<CommandRecord> {
        match self.session(key).await {
            Some(handle) => handle.lock().await.protocol.history(limit).to_vec(),
            None => Vec::new(),
        }
    }

    /// Whether the session's shell has emitted protocol markers.
    pub async fn has_protocol_support(&self, key: &SessionKey) -> bool {
        match self.session(key).await {
            Some(handle) => handle.lock().await.protocol.has_protocol_support(),
            None => false,
        }
    }

    /// Point-in-time snapshot of one session's monitoring state.
    pub async fn get_stats(&self, key: &SessionKey) -> DomainResult<serde_json::Value> {
        let handle = self
            .session(key)
            .await
            .ok_or_else(|| DomainError::SessionNotFound { key: key.clone() })?;
        let state = handle.lock().await;
        Ok(json!({
            "user_id": key.user(),
            "session_id": key.session(),
            "shell_id": state.shell_id,
            "current_dir": state.protocol.current_dir(),
            "last_command": state.last_command,
            "command_count": state.command_count,
            "is_typing": state.is_typing,
            "is_collecting": state.is_collecting,
            "in_editor": state.protocol.in_editor(),
            "editor_name": state.protocol.editor_name(),
            "has_protocol_support": state.protocol.has_protocol_support(),
            "output_buffer_len": state.output.len(),
            "last_activity": state.last_activity.to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> TerminalMonitor {
        let (sidebar_tx, _rx) = mpsc::channel(16);
        TerminalMonitor::new(None, sidebar_tx, MonitorConfig::default())
    }

    fn marker(tail: &[u8]) -> Vec<u8> {
        let mut v = b"\x1b]133;".to_vec();
        v.extend_from_slice(tail);
        v
    }

    #[tokio::test]
    async fn test_register_and_query_lifecycle() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");

        m.register_session("u1", "s1", "shell-1", "/home/u1").await;
        assert_eq!(m.session_count().await, 1);
        assert!(!m.is_typing(&key).await);
        assert!(m.get_last_command(&key).await.is_none());

        m.unregister_session(&key).await.expect("unregister");
        assert_eq!(m.session_count().await, 0);
        assert!(m.get_stats(&key).await.is_err());
        assert!(m.unregister_session(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_is_ignored() {
        let m = monitor();
        let key = SessionKey::new("ghost", "s1");
        // None of these may panic or create state.
        m.process_input(&key, b"ls\n").await;
        m.process_output(&key, b"output").await;
        assert_eq!(m.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_marker_path_records_command() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/work").await;

        m.process_input(&key, b"cargo build\n").await;
        m.process_output(&key, &marker(b"B\x07")).await;
        m.process_output(&key, b"   Compiling tsm v0.1.0\r\n").await;
        m.process_output(&key, &marker(b"D;0\x07")).await;

        assert_eq!(m.get_last_command(&key).await.as_deref(), Some("cargo build"));
        assert!(m.has_protocol_support(&key).await);

        let history = m.get_command_history(&key, 0).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "cargo build");
        assert_eq!(history[0].exit_code, 0);
        assert_eq!(history[0].pwd, "/work");
    }

    #[tokio::test]
    async fn test_typing_state_follows_input() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/").await;

        m.process_input(&key, b"git st").await;
        assert!(m.is_typing(&key).await);
        assert_eq!(m.get_current_command(&key).await.as_deref(), Some("git st"));

        m.process_input(&key, b"atus\n").await;
        assert!(!m.is_typing(&key).await);
        assert!(m.get_current_command(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_editor_heuristic_entry_and_prompt_exit() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/").await;

        m.process_input(&key, b"vim notes.txt\n").await;
        assert!(m.is_in_editor_mode(&key).await);
        assert_eq!(m.get_editor_name(&key).await.as_deref(), Some("vim"));

        // Editor keystrokes are suppressed.
        m.process_input(&key, b"iHello world").await;
        assert!(m.get_current_command(&key).await.is_none());

        // A prompt reappearing means the editor exited.
        m.process_output(&key, b"\x1b[2J\r\nuser@host:~$ ").await;
        assert!(!m.is_in_editor_mode(&key).await);
        assert!(m.get_editor_name(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_editor_exits_when_command_completes_via_markers() {
        // Heuristic editor entry on a shell that emits standard markers:
        // the editor command's own exit marker must clear editor mode.
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/").await;

        m.process_input(&key, b"vim notes.txt\n").await;
        assert!(m.is_in_editor_mode(&key).await);

        m.process_output(&key, &marker(b"B\x07")).await;
        m.process_output(&key, &marker(b"D;0\x07")).await;
        assert!(!m.is_in_editor_mode(&key).await);
        assert!(m.get_editor_name(&key).await.is_none());

        // The session monitors normally again afterwards.
        m.process_input(&key, b"ls").await;
        assert_eq!(m.get_current_command(&key).await.as_deref(), Some("ls"));
        m.process_input(&key, b"\n").await;
        m.process_output(&key, &marker(b"B\x07")).await;
        m.process_output(&key, &marker(b"D;0\x07")).await;
        assert_eq!(m.get_last_command(&key).await.as_deref(), Some("ls"));
    }

    #[tokio::test]
    async fn test_editor_markers_override_heuristics() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/").await;

        m.process_output(&key, &marker(b"G;nano\x07")).await;
        assert!(m.is_in_editor_mode(&key).await);
        assert_eq!(m.get_editor_name(&key).await.as_deref(), Some("nano"));

        // Marker-driven sessions ignore the prompt-shaped-output exit.
        m.process_output(&key, b"$ ").await;
        assert!(m.is_in_editor_mode(&key).await);

        m.process_output(&key, &marker(b"H\x07")).await;
        assert!(!m.is_in_editor_mode(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_completion_on_soft_timeout() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/tmp").await;

        m.process_input(&key, b"ls\n").await;
        m.process_output(&key, b"file-a file-b\r\n").await;
        // Not yet: soft timeout hasn't elapsed and no prompt drawn.
        assert!(m.get_command_history(&key, 0).await.is_empty());

        tokio::time::advance(std::time::Duration::from_millis(600)).await;
        m.process_output(&key, b"").await;

        let history = m.get_command_history(&key, 0).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "ls");
        assert_eq!(history[0].exit_code, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_completion_on_hard_timeout_without_output() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/tmp").await;

        m.process_input(&key, b"sleep 100\n").await;
        tokio::time::advance(std::time::Duration::from_millis(1900)).await;
        m.process_output(&key, b"").await;
        assert!(m.get_command_history(&key, 0).await.is_empty());

        tokio::time::advance(std::time::Duration::from_millis(200)).await;
        m.process_output(&key, b"").await;
        assert_eq!(m.get_command_history(&key, 0).await.len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_completion_on_prompt() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/tmp").await;

        m.process_input(&key, b"cat missing.txt\n").await;
        m.process_output(&key, b"cat: missing.txt: No such file or directory\r\nuser@host:~$ ")
            .await;

        let history = m.get_command_history(&key, 0).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "cat missing.txt");
        assert_eq!(history[0].exit_code, 1);
    }

    #[tokio::test]
    async fn test_markers_preempt_fallback_collection() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/tmp").await;

        m.process_input(&key, b"true\n").await;
        m.process_output(&key, &marker(b"B\x07")).await;
        m.process_output(&key, &marker(b"D;0\x07")).await;

        let history = m.get_command_history(&key, 0).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "true");

        // Fallback must not double-report after the marker completion.
        m.process_output(&key, b"user@host:~$ ").await;
        assert_eq!(m.get_command_history(&key, 0).await.len(), 1);
    }

    #[tokio::test]
    async fn test_workdir_tracking_from_output() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/home/u1").await;

        m.process_input(&key, b"cd /srv/app\n").await;
        m.process_output(&key, b"$ cd /srv/app\r\nuser@host:/srv/app$ ").await;

        let stats = m.get_stats(&key).await.expect("stats");
        assert_eq!(stats["current_dir"], "/srv/app");
    }

    #[tokio::test]
    async fn test_update_typing_status_override() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "sh", "/").await;

        m.update_typing_status(&key, true).await;
        assert!(m.is_typing(&key).await);
        m.update_typing_status(&key, false).await;
        assert!(!m.is_typing(&key).await);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let m = monitor();
        let key = SessionKey::new("u1", "s1");
        m.register_session("u1", "s1", "shell-9", "/data").await;

        let stats = m.get_stats(&key).await.expect("stats");
        assert_eq!(stats["shell_id"], "shell-9");
        assert_eq!(stats["current_dir"], "/data");
        assert_eq!(stats["command_count"], 0);
        assert_eq!(stats["has_protocol_support"], false);
    }
}
