use std::borrow::Cow;
use std::collections::HashMap;

/// A token id: an index into the vocabulary.
pub type TokenId = u32;

/// Reserved id for unknown input.
pub const TOKEN_UNKNOWN: TokenId = 0;
/// Reserved beginning-of-sequence id.
pub const TOKEN_BOS: TokenId = 1;
/// Reserved end-of-sequence id.
pub const TOKEN_EOS: TokenId = 2;

/// First id of the byte-fallback range: byte `b` encodes as `b + 3`.
pub(crate) const BYTE_FALLBACK_BASE: TokenId = 3;

/// One vocabulary entry: the token's raw bytes (not necessarily valid
/// UTF-8) and its merge score.
#[derive(Debug, Clone)]
pub struct TokenScore {
    pub bytes: Vec<u8>,
    pub score: f32,
}

/// Ordered vocabulary with a reverse bytes-to-id map.
#[derive(Debug, Default)]
pub struct Vocab {
    pub id_to_token: Vec<TokenScore>,
    token_to_id: HashMap<Vec<u8>, TokenId>,
}

impl Vocab {
    pub fn with_capacity(n_vocab: usize) -> Self {
        Self {
            id_to_token: Vec::with_capacity(n_vocab),
            token_to_id: HashMap::with_capacity(n_vocab),
        }
    }

    /// Append the next token. Later duplicates win the reverse mapping.
    pub fn push(&mut self, bytes: Vec<u8>, score: f32) {
        let id = self.id_to_token.len() as TokenId;
        self.token_to_id.insert(bytes.clone(), id);
        self.id_to_token.push(TokenScore { bytes, score });
    }

    pub fn n_vocab(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn lookup(&self, bytes: &[u8]) -> Option<TokenId> {
        self.token_to_id.get(bytes).copied()
    }

    pub fn score(&self, id: TokenId) -> f32 {
        self.id_to_token[id as usize].score
    }

    /// The raw bytes of a token, or `None` for out-of-range ids.
    pub fn token_bytes(&self, id: TokenId) -> Option<&[u8]> {
        self.id_to_token.get(id as usize).map(|t| t.bytes.as_slice())
    }

    /// The token rendered as text. Tokens holding partial UTF-8 sequences
    /// are rendered lossily; use [`Vocab::token_bytes`] to stream exact
    /// bytes.
    pub fn token_to_str(&self, id: TokenId) -> Cow<'_, str> {
        match self.token_bytes(id) {
            Some(bytes) => String::from_utf8_lossy(bytes),
            None => Cow::Borrowed(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_duplicate_wins_reverse_lookup() {
        let mut vocab = Vocab::with_capacity(3);
        vocab.push(b"ab".to_vec(), 1.0);
        vocab.push(b"cd".to_vec(), 2.0);
        vocab.push(b"ab".to_vec(), 3.0);
        assert_eq!(vocab.lookup(b"ab"), Some(2));
        assert_eq!(vocab.token_bytes(0), Some(&b"ab"[..]));
    }

    #[test]
    fn out_of_range_is_empty() {
        let vocab = Vocab::default();
        assert_eq!(vocab.token_bytes(5), None);
        assert_eq!(vocab.token_to_str(5), "");
    }
}
