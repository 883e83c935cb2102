//! Output/input heuristics for shells without protocol markers.
//!
//! Best-effort approximations, not ground truth: prompt shapes, a small set
//! of well-known error phrases, editor command names, and working-directory
//! echoes.

use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::sync::OnceLock;

/// Error phrases (lowercase) that indicate a failed command in collected
/// output. Presence of any implies exit code 1.
const ERROR_INDICATORS: &[&str] = &[
    "command not found",
    "no such file or directory",
    "permission denied",
    "invalid argument",
    "operation not permitted",
    "syntax error",
    "cannot access",
    "not recognized",
];

/// Prompt shapes matched against the trailing end of collected output.
fn prompt_patterns() -> &'static [BytesRegex] {
    static PATTERNS: OnceLock<Vec<BytesRegex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\w+@[\w-]+:[^$\n]*\$\s*$", // user@host:path$
            r"bash-[\d.]+\$\s*$",        // bash-5.1$
            r"\]\$\s*$",                 // ]$
            r"\$\s*$",                   // $
            r"#\s*$",                    // # (root)
            r">\s*$",                    // >
        ]
        .iter()
        .filter_map(|p| BytesRegex::new(p).ok())
        .collect()
    })
}

fn editor_command_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(vim?|nvim|nano|emacs|less|more|man)\b").ok())
        .as_ref()
}

fn cd_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:^|\s)cd\s+(\S+)").ok())
        .as_ref()
}

/// Returns true if the trailing output looks like a shell prompt was drawn.
pub fn detect_prompt(output: &[u8]) -> bool {
    prompt_patterns().iter().any(|p| p.is_match(output))
}

/// Infers an exit code from collected output by scanning (case-insensitively)
/// for known error phrases. Any match implies 1, absence implies 0.
pub fn infer_exit_code(output: &[u8]) -> i32 {
    let lower = output.to_ascii_lowercase();
    for indicator in ERROR_INDICATORS {
        if lower
            .windows(indicator.len())
            .any(|w| w == indicator.as_bytes())
        {
            return 1;
        }
    }
    0
}

/// Returns the editor name if the command launches one (`vim`, `nano`, ...).
pub fn detect_editor_command(command: &str) -> Option<&str> {
    editor_command_pattern()?
        .captures(command)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Extracts a `cd` target from output (echoed command lines).
pub fn extract_cd_target(text: &str) -> Option<&str> {
    cd_pattern()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Finds a bare absolute-path line, as printed by `pwd`.
pub fn extract_pwd_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| {
        !line.is_empty() && line.starts_with('/') && !line.contains(' ')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_detection() {
        assert!(detect_prompt(b"file.txt\r\n$ "));
        assert!(detect_prompt(b"done\nuser@host:~/work$ "));
        assert!(detect_prompt(b"bash-5.1$ "));
        assert!(detect_prompt(b"# "));
        assert!(!detect_prompt(b"downloading 42% complete"));
        assert!(!detect_prompt(b"price: $42 is too much\nmore output"));
    }

    #[test]
    fn test_exit_code_inference() {
        assert_eq!(infer_exit_code(b"bash: wat: command not found\n"), 1);
        assert_eq!(infer_exit_code(b"touch: Permission Denied\n"), 1);
        assert_eq!(infer_exit_code(b"file1.txt file2.txt\n"), 0);
        assert_eq!(infer_exit_code(b""), 0);
    }

    #[test]
    fn test_editor_command_detection() {
        assert_eq!(detect_editor_command("vim main.rs"), Some("vim"));
        assert_eq!(detect_editor_command("  nano /etc/hosts"), Some("nano"));
        assert_eq!(detect_editor_command("man tar"), Some("man"));
        assert_eq!(detect_editor_command("less +F app.log"), Some("less"));
        assert_eq!(detect_editor_command("git log"), None);
        // Substrings must not match: "vimdiff" is not "vim\b".
        assert_eq!(detect_editor_command("vimtutor"), None);
    }

    #[test]
    fn test_cd_extraction() {
        assert_eq!(extract_cd_target("cd /tmp"), Some("/tmp"));
        assert_eq!(extract_cd_target("$ cd src && ls"), Some("src"));
        assert_eq!(extract_cd_target("echo hello"), None);
    }

    #[test]
    fn test_pwd_line_extraction() {
        assert_eq!(extract_pwd_line("  /home/user/project\n$ "), Some("/home/user/project"));
        assert_eq!(extract_pwd_line("not a path\nalso not"), None);
        // Paths with spaces are skipped (too ambiguous).
        assert_eq!(extract_pwd_line("/home/user/my files"), None);
    }
}
