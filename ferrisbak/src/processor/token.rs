use std::fmt;

use uuid::Uuid;

/// Per-job upload token.
///
/// 32 lowercase hex characters. All tokens have the same length, so two
/// distinct tokens are never prefixes of each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadToken(String);

impl UploadToken {
    /// Mint a fresh token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_fixed_length_hex() {
        let a = UploadToken::generate();
        let b = UploadToken::generate();

        assert_ne!(a, b);
        for token in [&a, &b] {
            assert_eq!(token.as_str().len(), 32);
            assert!(
                token
                    .as_str()
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            );
        }
    }
}
