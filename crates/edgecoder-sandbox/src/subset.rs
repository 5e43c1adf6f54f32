// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Python subset validation.
//!
//! Generated Python is rejected *before* execution when it steps outside the
//! permitted subset: no `import` / `from … import` statements, no calls to
//! `open`, `eval`, `exec`, `compile` or `__import__`.
//!
//! The scanner works on source text with string literals and comments blanked
//! out, tracking triple-quoted strings across lines. It deliberately
//! over-rejects pathological snippets (a banned name called inside an
//! f-string expression still trips it) and never under-rejects — the safe
//! direction for a sandbox gate.

/// Builtins whose direct call is rejected.
const BANNED_CALLS: &[&str] = &["open", "eval", "exec", "compile", "__import__"];

/// A subset violation with a human-readable diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetViolation {
    pub line: usize,
    pub reason: String,
}

impl std::fmt::Display for SubsetViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// Check `source` against the permitted Python subset.
pub fn validate_python(source: &str) -> Result<(), SubsetViolation> {
    let cleaned = blank_strings_and_comments(source);

    for (idx, line) in cleaned.lines().enumerate() {
        let lineno = idx + 1;

        // Simple statements can share a line via `;`.
        for stmt in line.split(';') {
            let stripped = stmt.trim_start();
            if first_word_is(stripped, "import") || first_word_is(stripped, "from") {
                return Err(SubsetViolation {
                    line: lineno,
                    reason: "import statements are not permitted".into(),
                });
            }
        }

        if let Some(name) = find_banned_call(line) {
            return Err(SubsetViolation {
                line: lineno,
                reason: format!("call to {name}() is not permitted"),
            });
        }
    }
    Ok(())
}

/// True when `stmt` begins with `word` as a whole keyword.
fn first_word_is(stmt: &str, word: &str) -> bool {
    match stmt.strip_prefix(word) {
        Some(rest) => rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace()),
        None => false,
    }
}

/// Find a banned builtin invoked as a bare name (`eval(…)` but not
/// `module.eval(…)` — attribute calls resolve to a different function).
fn find_banned_call(line: &str) -> Option<&'static str> {
    let bytes = line.as_bytes();
    for &name in BANNED_CALLS {
        let mut start = 0;
        while let Some(pos) = line[start..].find(name) {
            let at = start + pos;
            start = at + name.len();

            let before_ok = at == 0 || !is_ident_char(bytes[at - 1]) && bytes[at - 1] != b'.';
            if !before_ok {
                continue;
            }
            let after = &line[at + name.len()..];
            let after_trimmed = after.trim_start();
            if !after.is_empty() && is_ident_char(after.as_bytes()[0]) {
                continue; // longer identifier, e.g. `open_file`
            }
            if after_trimmed.starts_with('(') {
                return Some(name);
            }
        }
    }
    None
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replace the contents of string literals and comments with spaces,
/// preserving line structure so diagnostics keep real line numbers.
fn blank_strings_and_comments(source: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Single(char),      // '…' or "…"
        Triple(char),      // '''…''' or """…"""
    }

    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            State::Code => {
                if c == '#' {
                    // Comment runs to end of line.
                    while i < chars.len() && chars[i] != '\n' {
                        out.push(' ');
                        i += 1;
                    }
                    continue;
                }
                if c == '\'' || c == '"' {
                    if i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c {
                        state = State::Triple(c);
                        out.push(' ');
                        out.push(' ');
                        out.push(' ');
                        i += 3;
                        continue;
                    }
                    state = State::Single(c);
                    out.push(' ');
                    i += 1;
                    continue;
                }
                out.push(c);
                i += 1;
            }
            State::Single(quote) => {
                if c == '\\' && i + 1 < chars.len() {
                    out.push(' ');
                    out.push(if chars[i + 1] == '\n' { '\n' } else { ' ' });
                    i += 2;
                    continue;
                }
                if c == quote || c == '\n' {
                    // Unterminated single-quoted strings end at the newline,
                    // as in CPython's tokenizer.
                    state = State::Code;
                    out.push(if c == '\n' { '\n' } else { ' ' });
                    i += 1;
                    continue;
                }
                out.push(' ');
                i += 1;
            }
            State::Triple(quote) => {
                if c == quote
                    && i + 2 < chars.len()
                    && chars[i + 1] == quote
                    && chars[i + 2] == quote
                {
                    state = State::Code;
                    out.push(' ');
                    out.push(' ');
                    out.push(' ');
                    i += 3;
                    continue;
                }
                out.push(if c == '\n' { '\n' } else { ' ' });
                i += 1;
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_code_passes() {
        let src = "a = 1\nb = 2\nprint(a + b)\n";
        assert!(validate_python(src).is_ok());
    }

    #[test]
    fn import_statement_is_rejected() {
        let err = validate_python("import os\nprint('hi')").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.reason.contains("import"));
    }

    #[test]
    fn from_import_is_rejected() {
        assert!(validate_python("from os import path").is_err());
    }

    #[test]
    fn indented_import_is_rejected() {
        let src = "if True:\n    import subprocess\n";
        let err = validate_python(src).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn import_after_semicolon_is_rejected() {
        assert!(validate_python("x = 1; import os").is_err());
    }

    #[test]
    fn importlib_identifier_is_not_an_import_statement() {
        // A bare name that merely starts with "import" must not trip the scan.
        assert!(validate_python("important = 3\nprint(important)").is_ok());
    }

    #[test]
    fn import_inside_string_is_allowed() {
        assert!(validate_python("s = 'import os'\nprint(s)").is_ok());
    }

    #[test]
    fn import_inside_triple_string_is_allowed() {
        let src = "doc = \"\"\"\nimport os\neval('x')\n\"\"\"\nprint(doc)";
        assert!(validate_python(src).is_ok());
    }

    #[test]
    fn import_in_comment_is_allowed() {
        assert!(validate_python("# import os would be nice\nprint(1)").is_ok());
    }

    #[test]
    fn eval_call_is_rejected() {
        let err = validate_python("x = eval('1+1')").unwrap_err();
        assert!(err.reason.contains("eval"));
    }

    #[test]
    fn exec_and_compile_calls_are_rejected() {
        assert!(validate_python("exec('print(1)')").is_err());
        assert!(validate_python("compile('x', '<s>', 'eval')").is_err());
    }

    #[test]
    fn open_call_is_rejected() {
        assert!(validate_python("f = open('/etc/passwd')").is_err());
    }

    #[test]
    fn dunder_import_call_is_rejected() {
        assert!(validate_python("os = __import__('os')").is_err());
    }

    #[test]
    fn banned_call_with_space_before_paren_is_rejected() {
        assert!(validate_python("eval ('1')").is_err());
    }

    #[test]
    fn attribute_call_with_banned_suffix_is_allowed() {
        // re.compile resolves to a different function than the builtin.
        assert!(validate_python("pattern.compile(flags)").is_ok());
    }

    #[test]
    fn longer_identifier_is_not_banned() {
        assert!(validate_python("open_file('x')\nevaluate(1)").is_ok());
    }

    #[test]
    fn banned_name_without_call_is_allowed() {
        assert!(validate_python("callbacks = [open]\nprint(len(callbacks))").is_ok());
    }

    #[test]
    fn hostile_rm_rf_snippet_is_rejected_on_import() {
        let src = "import os\nos.system('rm -rf /')";
        let err = validate_python(src).unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn escaped_quote_does_not_terminate_string() {
        assert!(validate_python(r#"s = 'it\'s import season'"#).is_ok());
    }
}
