use crate::common::*;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a, stable across platforms and toolchains.
fn fnv1a_hash(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Maps text to a fixed length token sequence.
pub trait Tokenizer
where
    Self: Send + Sync,
{
    /// Returns an `[context_length]` int64 tensor padded with zeros.
    ///
    /// Text longer than the context fails unless `truncate` is set, in which
    /// case it is cut and the last token is replaced by the end token.
    fn tokenize(&self, text: &str, context_length: usize, truncate: bool) -> Result<Tensor>;
}

/// Hashes lower-cased words into a fixed vocabulary.
///
/// Token ids only depend on the text and the vocabulary size, so saved
/// weights keep their meaning across builds.
///
/// The two last ids are reserved for the start and end tokens. Zero is the
/// padding id and never produced by a word.
#[derive(Debug, Clone)]
pub struct HashTokenizer {
    vocab_size: usize,
}

impl HashTokenizer {
    pub fn new(vocab_size: usize) -> Result<Self> {
        ensure!(vocab_size > 3, "vocab_size must be greater than 3");
        Ok(Self { vocab_size })
    }

    pub fn start_token(&self) -> i64 {
        self.vocab_size as i64 - 2
    }

    pub fn end_token(&self) -> i64 {
        self.vocab_size as i64 - 1
    }

    fn word_token(&self, word: &str) -> i64 {
        let num_words = self.vocab_size as u64 - 3;
        (fnv1a_hash(word.as_bytes()) % num_words) as i64 + 1
    }

    fn tokens(&self, text: &str) -> Vec<i64> {
        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .map(|word| self.word_token(&word.to_lowercase()));
        std::iter::once(self.start_token())
            .chain(words)
            .chain(std::iter::once(self.end_token()))
            .collect()
    }
}

impl Tokenizer for HashTokenizer {
    fn tokenize(&self, text: &str, context_length: usize, truncate: bool) -> Result<Tensor> {
        ensure!(context_length >= 2, "context_length must be at least 2");
        let mut tokens = self.tokens(text);

        if tokens.len() > context_length {
            ensure!(
                truncate,
                "input '{}' is too long for context length {}",
                text,
                context_length
            );
            tokens.truncate(context_length);
            tokens[context_length - 1] = self.end_token();
        }
        tokens.resize(context_length, 0);

        Ok(Tensor::of_slice(&tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_to_context_length() -> Result<()> {
        let tokenizer = HashTokenizer::new(1000)?;
        let tokens = Vec::<i64>::from(&tokenizer.tokenize("The left dog", 8, false)?);
        assert_eq!(tokens.len(), 8);
        assert_eq!(tokens[0], tokenizer.start_token());
        assert_eq!(tokens[4], tokenizer.end_token());
        assert!(tokens[1..4].iter().all(|&t| t > 0 && t < tokenizer.start_token()));
        assert!(tokens[5..].iter().all(|&t| t == 0));
        Ok(())
    }

    #[test]
    fn stable_token_ids() -> Result<()> {
        assert_eq!(fnv1a_hash(b""), FNV_OFFSET);
        let tokenizer = HashTokenizer::new(1000)?;
        let tokens = Vec::<i64>::from(&tokenizer.tokenize("left dog", 4, false)?);
        assert_eq!(
            tokens,
            vec![tokenizer.start_token(), 138, 941, tokenizer.end_token()]
        );
        Ok(())
    }

    #[test]
    fn case_insensitive() -> Result<()> {
        let tokenizer = HashTokenizer::new(1000)?;
        let lhs = Vec::<i64>::from(&tokenizer.tokenize("Brown DOG", 6, false)?);
        let rhs = Vec::<i64>::from(&tokenizer.tokenize("brown dog", 6, false)?);
        assert_eq!(lhs, rhs);
        Ok(())
    }

    #[test]
    fn overlong_input() -> Result<()> {
        let tokenizer = HashTokenizer::new(1000)?;
        let text = "one two three four five six";
        assert!(tokenizer.tokenize(text, 4, false).is_err());

        let tokens = Vec::<i64>::from(&tokenizer.tokenize(text, 4, true)?);
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[3], tokenizer.end_token());
        Ok(())
    }

    #[test]
    fn empty_text() -> Result<()> {
        let tokenizer = HashTokenizer::new(1000)?;
        let tokens = Vec::<i64>::from(&tokenizer.tokenize("", 3, false)?);
        assert_eq!(
            tokens,
            vec![tokenizer.start_token(), tokenizer.end_token(), 0]
        );
        Ok(())
    }
}
