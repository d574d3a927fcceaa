//! Terminal-buffer heuristics for when hooks are absent or late.
//!
//! Both functions are pure text scans with no side effects, so the polling
//! loops and tests can share them.

/// Selector glyph Claude Code's interactive UI places before the active option.
const SELECTOR: char = '\u{276F}'; // ❯

/// Detect the Claude Code permission selection UI.
///
/// Checks individual lines so the selector arrow must be on the SAME line as
/// "Yes", not just somewhere in the same capture window. Callers should pass
/// only the last ~5 pane lines; older output can contain both tokens by
/// coincidence.
pub fn detect_permission_prompt(terminal_output: &str) -> bool {
    terminal_output
        .lines()
        .any(|line| line.contains(SELECTOR) && line.contains("Yes"))
}

/// Detect Claude Code's idle input prompt.
///
/// The last non-empty line starts with `>` or `❯`, and the buffer is not a
/// permission prompt.
pub fn detect_idle_prompt(terminal_output: &str) -> bool {
    if detect_permission_prompt(terminal_output) {
        return false;
    }
    terminal_output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with('>') || trimmed.starts_with(SELECTOR)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_prompt_empty_is_false() {
        assert!(!detect_permission_prompt(""));
    }

    #[test]
    fn permission_prompt_same_line_required() {
        // Selector and "Yes" on different lines is not a prompt.
        assert!(!detect_permission_prompt("\u{276F} No\n  Yes"));
        assert!(detect_permission_prompt("\u{276F} Yes"));
    }

    #[test]
    fn permission_prompt_with_surrounding_ui() {
        let pane = "Do you want to run this command?\n  \u{276F} Yes\n    No\n";
        assert!(detect_permission_prompt(pane));
    }

    #[test]
    fn permission_prompt_case_sensitive() {
        assert!(!detect_permission_prompt("\u{276F} yes"));
    }

    #[test]
    fn idle_prompt_on_last_line() {
        assert!(detect_idle_prompt("some output\n\n> "));
        assert!(detect_idle_prompt("some output\n\u{276F} \n\n"));
    }

    #[test]
    fn idle_prompt_excludes_permission_ui() {
        assert!(!detect_idle_prompt("run it?\n\u{276F} Yes\n"));
    }

    #[test]
    fn idle_prompt_empty_is_false() {
        assert!(!detect_idle_prompt(""));
        assert!(!detect_idle_prompt("plain output line"));
    }
}
