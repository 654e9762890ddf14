//! Embedding untrusted paths in `http-request replace-path` directives.
//!
//! A route's path is substituted, unquoted, into the directive
//!
//! ```text
//! http-request replace-path ^{path}(.*)$ '{target}\1'
//! ```
//!
//! The proxy tokenizes configuration lines: unquoted whitespace separates
//! arguments, an unquoted `#` starts a comment, quotes open literal regions,
//! a backslash escapes the following character (except inside single quotes)
//! and, inside double quotes, `$` introduces an environment variable. A path
//! is only embedded if scanning it under these rules leaves it a single,
//! well-formed argument. Paths are never rewritten to make them safe, since
//! that would change how already-accepted routes match.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnsafeValue {
    #[error("unquoted {0:?} at offset {1} would split the directive")]
    UnquotedSeparator(char, usize),

    #[error("unterminated {0} quote")]
    UnbalancedQuote(char),

    #[error("'$' at offset {0} inside double quotes must be followed by a letter or '_'")]
    InvalidVariable(usize),

    #[error("control character at offset {0}")]
    ControlCharacter(usize),
}

/// Describes paths that are accepted today but are rejected by the stricter
/// regular-expression rules planned for a future version.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StrictPathError {
    #[error("path contains an unescaped {0:?}")]
    UnescapedBracket(char),

    #[error("path has an unmatched closing parenthesis")]
    UnmatchedClose,

    #[error("path has an unmatched opening parenthesis")]
    UnmatchedOpen,

    #[error("nothing to repeat before {0:?} at offset {1}")]
    NothingToRepeat(char, usize),

    #[error("path is not a valid regular expression")]
    InvalidRegex,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Region {
    Unquoted,
    Single,
    Double,
}

/// Checks that a value can be embedded verbatim in a configuration line.
pub fn accept_value(value: &str) -> Result<(), UnsafeValue> {
    let mut region = Region::Unquoted;
    let mut chars = value.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        if c.is_control() {
            return Err(UnsafeValue::ControlCharacter(offset));
        }

        match (region, c) {
            (Region::Unquoted, '\'') => region = Region::Single,
            (Region::Single, '\'') => region = Region::Unquoted,
            (Region::Unquoted, '"') => region = Region::Double,
            (Region::Double, '"') => region = Region::Unquoted,

            // The escaped character is consumed with the backslash.
            (Region::Unquoted | Region::Double, '\\') => {
                if let Some((offset, next)) = chars.next() {
                    if next.is_control() {
                        return Err(UnsafeValue::ControlCharacter(offset));
                    }
                }
            }

            (Region::Unquoted, ' ' | '#') => return Err(UnsafeValue::UnquotedSeparator(c, offset)),

            (Region::Double, '$') => match chars.peek() {
                Some(&(_, next)) if next.is_ascii_alphabetic() || next == '_' => {}
                Some(_) => return Err(UnsafeValue::InvalidVariable(offset)),
                None => {}
            },

            _ => {}
        }
    }

    match region {
        Region::Unquoted => Ok(()),
        Region::Single => Err(UnsafeValue::UnbalancedQuote('\'')),
        Region::Double => Err(UnsafeValue::UnbalancedQuote('"')),
    }
}

/// Applies the stricter rules paths with a rewrite target will be held to in
/// a future version.
pub fn check_strict_path(path: &str) -> Result<(), StrictPathError> {
    let bytes = path.as_bytes();
    let escaped = |i: usize| i > 0 && bytes[i - 1] == b'\\';

    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'[' | b'{') && !escaped(i) {
            return Err(StrictPathError::UnescapedBracket(*b as char));
        }
    }

    let mut open = 0usize;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'(' if !escaped(i) => open += 1,
            b')' if !escaped(i) => {
                open = open
                    .checked_sub(1)
                    .ok_or(StrictPathError::UnmatchedClose)?;
            }
            _ => {}
        }
    }
    if open != 0 {
        return Err(StrictPathError::UnmatchedOpen);
    }

    for (i, pair) in bytes.windows(2).enumerate() {
        if matches!(pair[1], b'*' | b'+') && matches!(pair[0], b'$' | b'^' | b'\'' | b'+') {
            return Err(StrictPathError::NothingToRepeat(pair[1] as char, i + 1));
        }
    }

    regex::Regex::new(path).map_err(|_| StrictPathError::InvalidRegex)?;
    Ok(())
}

/// Renders the legacy path rewrite directive. The path is embedded verbatim
/// and must have been accepted by [`accept_value`].
pub fn replace_path_directive(path: &str, target: &str) -> String {
    format!(
        "http-request replace-path ^{path}(.*)$ '{}\\1'",
        escape_single_quoted(target)
    )
}

/// Wraps a value in single quotes so that it forms one literal argument.
pub fn single_quote(value: &str) -> String {
    format!("'{}'", escape_single_quoted(value))
}

/// Escapes a value for use inside a single-quoted region by closing the
/// region around each quote.
fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', r"'\''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Splits a configuration line into arguments the way the proxy does.
    fn tokenize(line: &str) -> Result<Vec<String>, String> {
        let mut tokens = Vec::new();
        let mut token = String::new();
        let mut in_token = false;
        let mut region = Region::Unquoted;
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            match region {
                Region::Unquoted => match c {
                    ' ' | '\t' => {
                        if in_token {
                            tokens.push(std::mem::take(&mut token));
                            in_token = false;
                        }
                    }
                    '#' => break,
                    '\\' => {
                        token.push(chars.next().unwrap_or('\\'));
                        in_token = true;
                    }
                    '\'' => {
                        region = Region::Single;
                        in_token = true;
                    }
                    '"' => {
                        region = Region::Double;
                        in_token = true;
                    }
                    c => {
                        token.push(c);
                        in_token = true;
                    }
                },
                Region::Single => match c {
                    '\'' => region = Region::Unquoted,
                    c => token.push(c),
                },
                Region::Double => match c {
                    '"' => region = Region::Unquoted,
                    '\\' => token.push(chars.next().unwrap_or('\\')),
                    '$' => match chars.peek() {
                        Some(n) if n.is_ascii_alphabetic() || *n == '_' => {
                            let mut name = String::new();
                            while let Some(n) = chars.peek() {
                                if !(n.is_ascii_alphanumeric() || *n == '_') {
                                    break;
                                }
                                name.push(*n);
                                chars.next();
                            }
                            token.push_str(&format!("${{{name}}}"));
                        }
                        _ => return Err("invalid variable".to_string()),
                    },
                    c => token.push(c),
                },
            }
        }

        if region != Region::Unquoted {
            return Err("unterminated quote".to_string());
        }
        if in_token {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn is_single_directive(line: &str, target: &str) -> bool {
        match tokenize(line) {
            Ok(tokens) => {
                tokens.len() == 4
                    && tokens[0] == "http-request"
                    && tokens[1] == "replace-path"
                    && tokens[2].ends_with("(.*)$")
                    && tokens[3] == format!("{target}\\1")
            }
            Err(_) => false,
        }
    }

    #[test]
    fn accepts_plain_paths() {
        for path in [
            "",
            "/",
            "/foo",
            "/foo.*",
            "/foo|bar|baz",
            "/[A-Z]+(foo)",
            r"/foo\ bar",
            r"/foo\#bar",
            r"/foo\",
            r"/foo\\",
            "/'foo bar'",
            "/\"foo # bar\"",
            "/\"$HOME\"",
            "/\"$_x\"",
            r"/'\'",
            "/'\"'",
        ] {
            assert_eq!(accept_value(path), Ok(()), "{path:?}");
        }
    }

    #[test]
    fn rejects_unsafe_paths() {
        for (path, expected) in [
            (" ", UnsafeValue::UnquotedSeparator(' ', 0)),
            ("/foo # comment", UnsafeValue::UnquotedSeparator(' ', 4)),
            ("/#foo", UnsafeValue::UnquotedSeparator('#', 1)),
            ("/foo'", UnsafeValue::UnbalancedQuote('\'')),
            ("/foo\"", UnsafeValue::UnbalancedQuote('"')),
            (r#""\""#, UnsafeValue::UnbalancedQuote('"')),
            ("\"'\"'", UnsafeValue::UnbalancedQuote('\'')),
            ("/\"$1\"", UnsafeValue::InvalidVariable(2)),
            ("/\"$\"", UnsafeValue::InvalidVariable(2)),
            ("/foo\nbar", UnsafeValue::ControlCharacter(4)),
            ("/foo\\\tbar", UnsafeValue::ControlCharacter(5)),
        ] {
            assert_eq!(accept_value(path), Err(expected), "{path:?}");
        }
    }

    #[test]
    fn backslash_is_literal_inside_single_quotes() {
        // The backslash cannot escape the closing quote, so `/'\'` is one
        // quoted region and `/'\''` leaves a region open. A scanner that
        // skips the character after every backslash decides both the other
        // way.
        assert_eq!(accept_value(r"/'\'"), Ok(()));
        assert!(is_single_directive(&replace_path_directive(r"/'\'", "/"), "/"));

        assert_eq!(accept_value(r"/'\''"), Err(UnsafeValue::UnbalancedQuote('\'')));
        assert!(!is_single_directive(&replace_path_directive(r"/'\''", "/"), "/"));
    }

    #[test]
    fn strict_path_rules() {
        for path in ["/foo", "/foo.*", r"/foo\[", r"/foo\(", "/(foo)(bar)", "/foo|bar"] {
            assert_eq!(check_strict_path(path), Ok(()), "{path:?}");
        }
        for (path, expected) in [
            ("/[foo", StrictPathError::UnescapedBracket('[')),
            ("/foo{3,}", StrictPathError::UnescapedBracket('{')),
            ("/(foo)(bar", StrictPathError::UnmatchedOpen),
            ("/foo)", StrictPathError::UnmatchedClose),
            ("/^*", StrictPathError::NothingToRepeat('*', 2)),
            ("/$+", StrictPathError::NothingToRepeat('+', 2)),
            ("/a++", StrictPathError::NothingToRepeat('+', 3)),
            ("*foo", StrictPathError::InvalidRegex),
        ] {
            assert_eq!(check_strict_path(path), Err(expected), "{path:?}");
        }
    }

    #[test]
    fn renders_legacy_directive() {
        assert_eq!(
            replace_path_directive("/foo", "/"),
            r"http-request replace-path ^/foo(.*)$ '/\1'"
        );
        assert_eq!(
            replace_path_directive("/foo", "/it's"),
            r"http-request replace-path ^/foo(.*)$ '/it'\''s\1'"
        );
        assert_eq!(single_quote("a b"), "'a b'");
    }

    proptest! {
        #[test]
        fn accepted_paths_form_one_argument(path in "[a-z/\\\\ '\"#$_.*()\\[\\]{}+^|]{0,16}") {
            let line = replace_path_directive(&path, "/foo");
            prop_assert_eq!(
                accept_value(&path).is_ok(),
                is_single_directive(&line, "/foo"),
                "{}", line
            );
        }

        #[test]
        fn targets_are_literal(target in "[a-z/\\\\ '\"#$_.]{0,16}") {
            let line = replace_path_directive("/app", &target);
            prop_assert!(is_single_directive(&line, &target), "{}", line);
        }
    }
}
