use crate::transport::Error;

const SINGLE: &str = "*";
const REST: &str = ">";

/// Checks that `pattern` is a well-formed subscription pattern: non-empty
/// tokens, wildcards only as whole tokens, and `>` only in last position.
pub fn validate_pattern(pattern: &str) -> Result<(), Error> {
    let invalid = || Error::InvalidChannel(pattern.to_string());

    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;

    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        match *token {
            SINGLE => {}
            REST if i != last => return Err(invalid()),
            REST => {}
            _ if token.contains(['*', '>']) => return Err(invalid()),
            _ => {}
        }
    }

    Ok(())
}

/// Checks that `channel` is a concrete, publishable channel.
pub fn validate_channel(channel: &str) -> Result<(), Error> {
    validate_pattern(channel)?;

    if channel.split('.').any(|token| token == SINGLE || token == REST) {
        return Err(Error::WildcardPublish(channel.to_string()));
    }

    Ok(())
}

/// Whether the concrete `channel` matches the subscription `pattern`.
///
/// `*` matches exactly one token; a trailing `>` matches one or more.
pub fn matches(channel: &str, pattern: &str) -> bool {
    if channel == pattern {
        return true;
    }

    let mut channel_tokens = channel.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(expected) = pattern_tokens.next() {
        if expected == REST && pattern_tokens.peek().is_none() {
            return channel_tokens.next().is_some();
        }

        match channel_tokens.next() {
            Some(token) if expected == SINGLE || expected == token => {}
            _ => return false,
        }
    }

    channel_tokens.next().is_none()
}
