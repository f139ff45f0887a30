//! Anonymous session token type.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing a [`SessionToken`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionTokenError {
    /// The input string is empty.
    #[error("session token cannot be empty")]
    Empty,
    /// The input string is too long.
    #[error("session token must be at most {max} characters")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
    },
    /// The input contains characters outside the allowed set.
    #[error("session token may only contain ASCII letters, digits, '-' and '_'")]
    InvalidCharacter,
}

/// Opaque token identifying an anonymous (guest) shopper.
///
/// ## Constraints
///
/// - Length: 1-128 characters
/// - ASCII alphanumerics, `-` and `_` only (tokens end up inside cache keys)
///
/// ## Examples
///
/// ```
/// use cart_core::SessionToken;
///
/// assert!(SessionToken::parse("3f2b7c1e-guest").is_ok());
/// assert!(SessionToken::parse("").is_err());
/// assert!(SessionToken::parse("has:colon").is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Maximum token length.
    pub const MAX_LENGTH: usize = 128;

    /// Parse a `SessionToken` from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty, too long, or contains
    /// characters other than ASCII alphanumerics, `-` and `_`.
    pub fn parse(s: &str) -> Result<Self, SessionTokenError> {
        if s.is_empty() {
            return Err(SessionTokenError::Empty);
        }

        if s.len() > Self::MAX_LENGTH {
            return Err(SessionTokenError::TooLong {
                max: Self::MAX_LENGTH,
            });
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SessionTokenError::InvalidCharacter);
        }

        Ok(Self(s.to_owned()))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionToken {
    type Err = SessionTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for SessionToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_tokens() {
        assert!(SessionToken::parse("abc").is_ok());
        assert!(SessionToken::parse("a1-B2_c3").is_ok());
        assert!(SessionToken::parse(&"x".repeat(128)).is_ok());
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(SessionToken::parse(""), Err(SessionTokenError::Empty));
    }

    #[test]
    fn test_parse_too_long() {
        assert!(matches!(
            SessionToken::parse(&"x".repeat(129)),
            Err(SessionTokenError::TooLong { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_key_separators() {
        assert_eq!(
            SessionToken::parse("a:b"),
            Err(SessionTokenError::InvalidCharacter)
        );
        assert_eq!(
            SessionToken::parse("a b"),
            Err(SessionTokenError::InvalidCharacter)
        );
    }
}
