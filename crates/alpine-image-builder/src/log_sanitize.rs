//! Cleanup for child process output before it reaches the log sink.
//!
//! apk and tar write progress bars with carriage returns and colour escapes;
//! only the final state of a line is kept and every control sequence is dropped.

const MAX_LOG_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Esc {
    /// Saw ESC, waiting for the introducer.
    Start,
    /// `ESC [` ... final byte in `@..=~`.
    Csi,
    /// `ESC ]` ... BEL or ST.
    Osc,
    /// `ESC P`, `ESC X`, `ESC ^`, `ESC _` ... ST.
    Str,
    /// ESC seen inside an OSC/string; `\` terminates.
    StrEsc { osc: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    // A carriage return rewinds the terminal line: only the last segment is visible.
    let visible = input
        .trim_end_matches(['\r', '\n'])
        .rsplit('\r')
        .next()
        .unwrap_or_default();

    let mut out = String::with_capacity(visible.len().min(MAX_LOG_CHARS));
    let mut state: Option<Esc> = None;
    let mut count = 0usize;

    for c in visible.chars() {
        if let Some(s) = state {
            state = match (s, c) {
                (Esc::Start, '[') => Some(Esc::Csi),
                (Esc::Start, ']') => Some(Esc::Osc),
                (Esc::Start, 'P' | 'X' | '^' | '_') => Some(Esc::Str),
                (Esc::Start, _) => None,
                (Esc::Csi, '@'..='~') => None,
                (Esc::Csi, _) => Some(Esc::Csi),
                (Esc::Osc, '\x07') => None,
                (Esc::Osc, '\x1b') => Some(Esc::StrEsc { osc: true }),
                (Esc::Osc, _) => Some(Esc::Osc),
                (Esc::Str, '\x1b') => Some(Esc::StrEsc { osc: false }),
                (Esc::Str, _) => Some(Esc::Str),
                (Esc::StrEsc { .. }, '\\') => None,
                (Esc::StrEsc { osc }, '\x1b') => Some(Esc::StrEsc { osc }),
                (Esc::StrEsc { osc: true }, _) => Some(Esc::Osc),
                (Esc::StrEsc { osc: false }, _) => Some(Esc::Str),
            };
            continue;
        }

        match c {
            '\x1b' => state = Some(Esc::Start),
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }

        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn keeps_last_progress_segment() {
        let input = "(1/20) Installing musl\r(2/20) Installing busybox\r(20/20) Installing alpine-base";
        assert_eq!(sanitize_log_line(input), "(20/20) Installing alpine-base");
    }

    #[test]
    fn drops_colour_and_title_sequences() {
        let input = "\u{1b}[1;33mWARNING\u{1b}[0m: \u{1b}]0;apk\u{7}opening index";
        assert_eq!(sanitize_log_line(input), "WARNING: opening index");
    }

    #[test]
    fn drops_string_sequences_and_bidi_controls() {
        assert_eq!(sanitize_log_line("a\u{1b}Pdata\u{1b}\\b\u{202e}c"), "abc");
        assert_eq!(sanitize_log_line("tab\there"), "tab here");
    }

    #[test]
    fn truncates_runaway_lines() {
        let long = "x".repeat(10_000);
        let got = sanitize_log_line(&long);
        assert!(got.ends_with("...[truncated]"));
        assert!(got.len() < 5000);
    }
}
