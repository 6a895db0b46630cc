//! Shell-style glob matching for `@include` / `@exclude` rules.
//!
//! Supported syntax: `*` matches any run of characters (including none),
//! `?` matches exactly one character, `\` escapes the next character.
//! Matching is case-sensitive and anchored to the whole string.

/// A compiled glob. Keeps the source text so records can be re-serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchGlob {
    pattern: String,
    tokens: Vec<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnySeq,
}

impl MatchGlob {
    /// Compilation never fails: unterminated escapes keep the backslash
    /// as a literal.
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => tokens.push(Token::AnySeq),
                '?' => tokens.push(Token::AnyChar),
                '\\' => match chars.next() {
                    Some(escaped) => tokens.push(Token::Literal(escaped)),
                    None => tokens.push(Token::Literal('\\')),
                },
                other => tokens.push(Token::Literal(other)),
            }
        }
        Self { pattern, tokens }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whole-string wildcard match with star backtracking.
    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        let tokens = &self.tokens;

        let mut ti = 0; // text index
        let mut pi = 0; // token index
        let mut star: Option<(usize, usize)> = None; // (token after star, text pos)

        while ti < text.len() {
            match tokens.get(pi) {
                Some(Token::Literal(c)) if *c == text[ti] => {
                    ti += 1;
                    pi += 1;
                }
                Some(Token::AnyChar) => {
                    ti += 1;
                    pi += 1;
                }
                Some(Token::AnySeq) => {
                    star = Some((pi + 1, ti));
                    pi += 1;
                }
                _ => match star {
                    // Retry the last star against one more character.
                    Some((star_pi, star_ti)) => {
                        pi = star_pi;
                        ti = star_ti + 1;
                        star = Some((star_pi, star_ti + 1));
                    }
                    None => return false,
                },
            }
        }

        while let Some(Token::AnySeq) = tokens.get(pi) {
            pi += 1;
        }
        pi == tokens.len()
    }
}
