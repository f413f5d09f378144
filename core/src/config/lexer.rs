//! Line lexer for the configuration language.
//!
//! The configuration file is line oriented: each significant line is a
//! directive name followed by a value. `get_name_value` is the only tokenizer
//! and is shared by the file parser and the command-line path; the two differ
//! only in the separator (whitespace vs. `=`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("missing value after '{0}'")]
    MissingValue(String),

    #[error("empty directive line")]
    Empty,

    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),
}

/// Separator between a directive name and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sep {
    /// Configuration-file form: `Name value...`
    Whitespace,
    /// Command-line form: `Name=value...`
    Equals,
}

/// Strips leading whitespace and returns `None` for blank and comment lines.
pub fn significant(raw: &str) -> Option<&str> {
    let line = raw.trim_start();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    Some(line.trim_end())
}

/// Splits a line into a directive name and its value at the first unquoted
/// separator. The value has trailing whitespace trimmed and one level of
/// surrounding double quotes removed.
///
/// Lines without a value yield an empty value; callers that require one
/// (almost all directives) reject it with [LexError::MissingValue].
pub fn get_name_value(line: &str, sep: Sep) -> Result<(String, String), LexError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(LexError::Empty);
    }

    let mut in_quote = false;
    let mut split_at = None;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quote = !in_quote,
            c if !in_quote && is_sep(c, sep) => {
                split_at = Some(idx);
                break;
            }
            _ => {}
        }
    }
    if in_quote {
        return Err(LexError::UnterminatedQuote(line.to_string()));
    }

    let (name, value) = match split_at {
        Some(idx) => {
            let value = line[idx + 1..].trim();
            (&line[..idx], value)
        }
        None => (line, ""),
    };

    Ok((name.to_string(), unquote(value)?.to_string()))
}

/// As [get_name_value], but fails when the value is empty.
pub fn get_name_required_value(line: &str, sep: Sep) -> Result<(String, String), LexError> {
    let (name, value) = get_name_value(line, sep)?;
    if value.is_empty() {
        return Err(LexError::MissingValue(name));
    }
    Ok((name, value))
}

fn is_sep(c: char, sep: Sep) -> bool {
    match sep {
        Sep::Whitespace => c.is_ascii_whitespace(),
        Sep::Equals => c == '=',
    }
}

// A value that opens with a quote must close with one.
fn unquote(value: &str) -> Result<&str, LexError> {
    let v = value.trim();
    if let Some(rest) = v.strip_prefix('"') {
        return rest
            .strip_suffix('"')
            .ok_or_else(|| LexError::UnterminatedQuote(v.to_string()));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        assert!(significant("").is_none());
        assert!(significant("   \t").is_none());
        assert!(significant("# comment").is_none());
        assert!(significant("; comment").is_none());
        assert!(significant("  # indented comment").is_none());
        assert_eq!(significant("  CACert /etc/ca.crt  "), Some("CACert /etc/ca.crt"));
    }

    #[test]
    fn splits_on_first_whitespace() {
        let (n, v) = get_name_value("UserTimeout 300", Sep::Whitespace).unwrap();
        assert_eq!(n, "UserTimeout");
        assert_eq!(v, "300");

        // the value keeps its internal whitespace
        let (n, v) =
            get_name_value("Divert from ip 192.168.0.1 to ip *", Sep::Whitespace).unwrap();
        assert_eq!(n, "Divert");
        assert_eq!(v, "from ip 192.168.0.1 to ip *");
    }

    #[test]
    fn trims_trailing_whitespace_and_quotes() {
        let (_, v) = get_name_value("PidFile /var/run/divert.pid   \t", Sep::Whitespace).unwrap();
        assert_eq!(v, "/var/run/divert.pid");

        let (_, v) = get_name_value("ContentLogPathSpec \"%d/%u %s\"", Sep::Whitespace).unwrap();
        assert_eq!(v, "%d/%u %s");
    }

    #[test]
    fn equals_separator_for_command_line() {
        let (n, v) = get_name_value("MaxHTTPHeaderSize=4096", Sep::Equals).unwrap();
        assert_eq!(n, "MaxHTTPHeaderSize");
        assert_eq!(v, "4096");

        // whitespace does not split in command-line form
        let (n, v) = get_name_value("PassSite=example.com 192.168.0.1", Sep::Equals).unwrap();
        assert_eq!(n, "PassSite");
        assert_eq!(v, "example.com 192.168.0.1");
    }

    #[test]
    fn missing_value_is_an_error_when_required() {
        assert!(get_name_required_value("Daemon", Sep::Whitespace).is_err());
        assert!(get_name_required_value("Daemon=", Sep::Equals).is_err());
        assert!(get_name_value("Daemon", Sep::Whitespace).is_ok());
    }

    #[test]
    fn quoted_name_boundary() {
        let (n, v) = get_name_value("Chroot \"/var/run/divert jail\"", Sep::Whitespace).unwrap();
        assert_eq!(n, "Chroot");
        assert_eq!(v, "/var/run/divert jail");
        assert!(get_name_value("Chroot \"/unterminated", Sep::Whitespace).is_err());
    }
}
