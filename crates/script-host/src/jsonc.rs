//! JSON-with-comments reader for `readConfig`
//!
//! Config files may carry `//` and `/* */` comments and trailing commas;
//! a preprocessing pass strips those and the result goes through the
//! standard JSON parser.

use crate::error::HostError;
use std::path::Path;

/// Strip comments and trailing commas, preserving string literals.
#[must_use]
pub fn strip(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            ',' => {
                // drop the comma when the next significant char closes a
                // container
                let mut j = i + 1;
                while j < chars.len() {
                    match chars[j] {
                        ch if ch.is_whitespace() => j += 1,
                        '/' if chars.get(j + 1) == Some(&'/') => {
                            while j < chars.len() && chars[j] != '\n' {
                                j += 1;
                            }
                        }
                        '/' if chars.get(j + 1) == Some(&'*') => {
                            j += 2;
                            while j + 1 < chars.len() && !(chars[j] == '*' && chars[j + 1] == '/')
                            {
                                j += 1;
                            }
                            j = (j + 2).min(chars.len());
                        }
                        _ => break,
                    }
                }
                if matches!(chars.get(j), Some('}') | Some(']')) {
                    i += 1;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Load and parse a config file.
pub fn read_config(path: &Path) -> Result<serde_json::Value, HostError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| HostError::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&strip(&raw))
        .map_err(|e| HostError::Config(format!("{}: {}", path.display(), e)))
}
