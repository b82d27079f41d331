//! Output comparison: tokenisation and score calculation.
//!
//! Contestant and expected outputs are tokenised under one of two
//! alphabets and compared pairwise under the problem's comparison policy.
//! The result is an exact rational score in [0, 1].

use std::io::{self, BufRead};

use anyhow::{bail, Result};
use num_rational::BigRational;
use num_traits::{FromPrimitive, One, Zero};

use crate::settings::{ValidatorKind, ValidatorSettings};

/// Token alphabet for the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAlphabet {
    /// Tokens are runs of non-separator runes; separators are Unicode
    /// whitespace plus the file/group/record/unit separators
    /// U+001C..U+001F, which some runtimes also treat as whitespace.
    Whitespace,
    /// Tokens are maximal runs of `[0-9.-]`; every other rune separates.
    Numeric,
}

fn is_space(c: char) -> bool {
    c.is_whitespace() || ('\u{1c}'..='\u{1f}').contains(&c)
}

fn is_numeric_rune(c: char) -> bool {
    c == '.' || c == '-' || c.is_ascii_digit()
}

impl TokenAlphabet {
    fn is_token_char(self, c: char) -> bool {
        match self {
            TokenAlphabet::Whitespace => !is_space(c),
            TokenAlphabet::Numeric => is_numeric_rune(c),
        }
    }
}

/// Streaming token scanner over a buffered reader.
///
/// Decodes UTF-8 incrementally so tokens that straddle the reader's
/// internal buffer boundary come out whole.
pub struct TokenScanner<R: BufRead> {
    reader: R,
    alphabet: TokenAlphabet,
    carry: Vec<u8>,
    eof: bool,
}

impl<R: BufRead> TokenScanner<R> {
    pub fn new(reader: R, alphabet: TokenAlphabet) -> Self {
        Self {
            reader,
            alphabet,
            carry: Vec::new(),
            eof: false,
        }
    }

    fn fill_carry(&mut self) -> io::Result<()> {
        if self.eof {
            return Ok(());
        }
        let buf = self.reader.fill_buf()?;
        if buf.is_empty() {
            self.eof = true;
        } else {
            let len = buf.len();
            self.carry.extend_from_slice(buf);
            self.reader.consume(len);
        }
        Ok(())
    }

    fn next_char(&mut self) -> io::Result<Option<char>> {
        // A UTF-8 scalar is at most four bytes; keep pulling until one
        // decodes or the stream is exhausted.
        while self.carry.len() < 4 && !self.eof {
            self.fill_carry()?;
        }
        if self.carry.is_empty() {
            return Ok(None);
        }
        let prefix = &self.carry[..self.carry.len().min(4)];
        let decoded = match std::str::from_utf8(prefix) {
            Ok(s) => s.chars().next(),
            Err(err) if err.valid_up_to() > 0 => std::str::from_utf8(&prefix[..err.valid_up_to()])
                .expect("validated prefix")
                .chars()
                .next(),
            Err(_) => None,
        };
        match decoded {
            Some(c) => {
                self.carry.drain(..c.len_utf8());
                Ok(Some(c))
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream is not valid UTF-8",
            )),
        }
    }

    /// Returns the next token, or `None` at end of stream.
    pub fn next_token(&mut self) -> io::Result<Option<String>> {
        let mut token = String::new();
        while let Some(c) = self.next_char()? {
            if self.alphabet.is_token_char(c) {
                token.push(c);
            } else if !token.is_empty() {
                return Ok(Some(token));
            }
        }
        if token.is_empty() {
            Ok(None)
        } else {
            Ok(Some(token))
        }
    }
}

fn token_equal(expected: &str, contestant: &str) -> bool {
    expected == contestant
}

fn token_caseless_equal(expected: &str, contestant: &str) -> bool {
    expected.to_lowercase() == contestant.to_lowercase()
}

/// Numeric comparison with a tolerance relative to the expected value.
/// Two unparsable tokens compare equal; exactly one unparsable does not.
fn token_numeric_equal(expected: &str, contestant: &str, tolerance: f64) -> bool {
    match (expected.parse::<f64>(), contestant.parse::<f64>()) {
        (Ok(a), Ok(b)) => (a - b).abs() <= a.abs() * tolerance,
        (Err(_), Err(_)) => true,
        _ => false,
    }
}

fn clamped_score(value: f64) -> BigRational {
    let clamped = value.clamp(0.0, 1.0);
    BigRational::from_f64(clamped).unwrap_or_else(BigRational::zero)
}

/// Compares contestant output against expected output under the declared
/// policy and returns a score in [0, 1].
///
/// Under `literal` and `custom` the expected reader is never consulted:
/// the first contestant token is parsed as the score itself.
pub fn calculate_score<E: BufRead, C: BufRead>(
    validator: &ValidatorSettings,
    expected: E,
    contestant: C,
) -> Result<BigRational> {
    let alphabet = match validator.name {
        ValidatorKind::TokenNumeric => TokenAlphabet::Numeric,
        _ => TokenAlphabet::Whitespace,
    };
    let mut contestant_scanner = TokenScanner::new(contestant, alphabet);

    if matches!(
        validator.name,
        ValidatorKind::Literal | ValidatorKind::Custom
    ) {
        let token = match contestant_scanner.next_token()? {
            Some(token) => token,
            None => bail!("score stream ended before any token"),
        };
        return Ok(clamped_score(token.parse::<f64>().unwrap_or(0.0)));
    }

    let mut expected_scanner = TokenScanner::new(expected, alphabet);
    let tolerance = validator.tolerance();

    loop {
        let expected_token = expected_scanner.next_token()?;
        let contestant_token = contestant_scanner.next_token()?;
        let correct = match (&expected_token, &contestant_token) {
            (None, None) => break,
            (Some(e), Some(c)) => match validator.name {
                ValidatorKind::Token => token_equal(e, c),
                ValidatorKind::TokenCaseless => token_caseless_equal(e, c),
                ValidatorKind::TokenNumeric => token_numeric_equal(e, c, tolerance),
                ValidatorKind::Literal | ValidatorKind::Custom => unreachable!(),
            },
            // One stream ended before the other.
            _ => false,
        };
        if !correct {
            return Ok(BigRational::zero());
        }
    }
    Ok(BigRational::one())
}
