//! POSIX shell quoting.

/// Quote `value` so a POSIX shell reads it back as a single word.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::quote;

    #[test]
    fn plain_words_stay_bare() {
        assert_eq!(quote("ghcr.io/kv/node:51bee04"), "ghcr.io/kv/node:51bee04");
    }

    #[test]
    fn spaces_and_metacharacters_are_quoted() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("x; rm -rf /"), "'x; rm -rf /'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn embedded_single_quotes_survive() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
