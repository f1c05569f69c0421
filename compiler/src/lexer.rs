// Lexer for single Fortran statements.
//
// Tokenizes one specification or executable statement as it appears in a
// region line. Uses the `logos` crate for DFA-based lexing. Fortran is case
// insensitive; tokens keep their spans so callers recover the original text.
//
// Preconditions: input is one logical line (continuations already joined).
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Fortran statement tokens.
///
/// Identifiers and literals carry no value; their text is the span within
/// the line.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+|![^\n]*")]
pub enum Token {
    // ── Symbols ──
    #[token("::")]
    DoubleColon,
    #[token("=>")]
    Arrow,
    #[token("==")]
    EqEq,
    #[token("/=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("**")]
    Power,
    #[token("//")]
    Concat,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Equals,
    #[token("%")]
    Percent,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&")]
    Ampersand,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semicolon,

    // ── Operators and logical literals ──
    /// Dotted operator or logical constant, e.g. `.and.`, `.GT.`, `.true.`.
    #[regex(r"\.[a-zA-Z]+\.")]
    DotOp,

    // ── Literals ──
    /// Numeric literal with optional exponent and kind suffix (`1.0d0`, `8_8`).
    #[regex(r"[0-9]+(\.[0-9]*)?([eEdD][+-]?[0-9]+)?(_[a-zA-Z0-9]+)?")]
    #[regex(r"\.[0-9]+([eEdD][+-]?[0-9]+)?(_[a-zA-Z0-9]+)?")]
    Number,

    /// Single or double quoted string with doubled-quote escapes.
    #[regex(r#"'([^']|'')*'"#)]
    #[regex(r#""([^"]|"")*""#)]
    StringLit,

    // ── Identifier ──
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    /// Preprocessor directive occupying the rest of the line (`#ifdef GPU`).
    #[regex(r"#[^\n]*")]
    Directive,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::DoubleColon => write!(f, "::"),
            Token::Arrow => write!(f, "=>"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "/="),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::Power => write!(f, "**"),
            Token::Concat => write!(f, "//"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Equals => write!(f, "="),
            Token::Percent => write!(f, "%"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Ampersand => write!(f, "&"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Semicolon => write!(f, ";"),
            Token::DotOp => write!(f, "<operator>"),
            Token::Number => write!(f, "<number>"),
            Token::StringLit => write!(f, "<string>"),
            Token::Ident => write!(f, "<ident>"),
            Token::Directive => write!(f, "<directive>"),
        }
    }
}

// ── Public API ──

/// Lex one Fortran statement into tokens.
///
/// Returns all successfully parsed tokens together with any errors for
/// unrecognised characters. Lexing is non-fatal.
pub fn lex(line: &str) -> LexResult {
    let lexer = Token::lexer(line);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &line[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

/// Identifier occurrences in a line, in source order.
///
/// Identifiers that are component names (preceded by `%`) are skipped: they
/// never refer to a symbol of the enclosing scope.
pub fn identifier_spans(line: &str) -> Vec<Span> {
    let result = lex(line);
    let mut spans = Vec::new();
    let mut prev: Option<&Token> = None;
    for (tok, span) in &result.tokens {
        if *tok == Token::Ident && prev != Some(&Token::Percent) {
            spans.push(*span);
        }
        prev = Some(tok);
    }
    spans
}

/// The first identifier of an argument expression (`a(i, 1)` -> `a`).
pub fn leading_identifier(expr: &str) -> Option<&str> {
    let result = lex(expr);
    match result.tokens.first() {
        Some((Token::Ident, span)) => Some(&expr[span.start..span.end]),
        _ => None,
    }
}

/// True if the statement is a pointer assignment (`p => target`).
pub fn is_pointer_assignment(line: &str) -> bool {
    let result = lex(line);
    let mut depth = 0i32;
    for (tok, _) in &result.tokens {
        match tok {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            Token::Arrow if depth == 0 => return true,
            Token::Equals if depth == 0 => return false,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(line: &str) -> Vec<Token> {
        lex(line).tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_declaration() {
        assert_eq!(
            kinds("real(8), intent(in) :: a(nx)"),
            vec![
                Token::Ident,
                Token::LParen,
                Token::Number,
                Token::RParen,
                Token::Comma,
                Token::Ident,
                Token::LParen,
                Token::Ident,
                Token::RParen,
                Token::DoubleColon,
                Token::Ident,
                Token::LParen,
                Token::Ident,
                Token::RParen,
            ]
        );
    }

    #[test]
    fn lex_skips_trailing_comment() {
        assert_eq!(kinds("x = 1 ! set x"), vec![Token::Ident, Token::Equals, Token::Number]);
    }

    #[test]
    fn lex_dotted_operators_and_kinds() {
        assert_eq!(
            kinds("if (i .GT. 1.0d0) x = .true."),
            vec![
                Token::Ident,
                Token::LParen,
                Token::Ident,
                Token::DotOp,
                Token::Number,
                Token::RParen,
                Token::Ident,
                Token::Equals,
                Token::DotOp,
            ]
        );
    }

    #[test]
    fn lex_error_is_non_fatal() {
        let r = lex("a = b ? c");
        assert_eq!(r.errors.len(), 1);
        assert_eq!(r.tokens.len(), 4);
    }

    #[test]
    fn identifier_spans_skip_components() {
        let line = "t%a = a + b";
        let names: Vec<&str> = identifier_spans(line)
            .into_iter()
            .map(|s| &line[s.start..s.end])
            .collect();
        assert_eq!(names, vec!["t", "a", "b"]);
    }

    #[test]
    fn leading_identifier_of_argument() {
        assert_eq!(leading_identifier("a(i, 1)"), Some("a"));
        assert_eq!(leading_identifier("  b"), Some("b"));
        assert_eq!(leading_identifier("1.0"), None);
    }

    #[test]
    fn pointer_assignment_detection() {
        assert!(is_pointer_assignment("p => a"));
        assert!(!is_pointer_assignment("a(i) = b"));
        assert!(!is_pointer_assignment("call f(x => y)"));
    }
}
