use regex::Regex;

use crate::error::SettingsError;

/// Compiles a URL glob into an anchored regex. `**` matches any character
/// sequence including separators; `*` matches within one path segment.
pub fn compile_glob(pattern: &str) -> Result<Regex, SettingsError> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            ch if "\\.+()[]{}^$|".contains(ch) => {
                regex.push('\\');
                regex.push(ch);
            }
            ch => regex.push(ch),
        }
    }
    regex.push('$');
    Regex::new(&regex).map_err(|err| SettingsError::InvalidPattern {
        pattern: pattern.to_string(),
        detail: err.to_string(),
    })
}

pub fn glob_matches(pattern: &str, candidate: &str) -> Result<bool, SettingsError> {
    Ok(compile_glob(pattern)?.is_match(candidate))
}
