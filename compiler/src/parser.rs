// Parser for Fortran specification statements.
//
// Parses the token stream of one line (from the lexer) into either a type
// declaration or a `use` statement. Uses chumsky combinators. Argument lists
// of kinds, attributes and array shapes are kept as raw balanced text: the
// generator rewrites declarations, it never interprets their expressions.
//
// Preconditions: input is one specification statement.
// Postconditions: returns the parsed statement or a usage error naming the line.
// Failure modes: anything that is neither a declaration nor a use statement.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::diag::{codes, GenError, GenResult};
use crate::lexer::Token;

// ── AST ──

/// One attribute of a declaration, e.g. `intent(in)` or `allocatable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Lower-case keyword (`intent`, `dimension`, ...).
    pub name: String,
    /// Text between the outer parentheses, if any.
    pub args: Option<String>,
    /// Attribute exactly as written.
    pub text: String,
}

/// One declared entity, e.g. `a(nx, ny)` or `n = 4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    /// Text between the shape parentheses, if any.
    pub dims: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub type_spec: String,
    pub attributes: Vec<Attribute>,
    pub entities: Vec<Entity>,
    /// Entity list exactly as written after `::`.
    pub entity_text: String,
}

impl Declaration {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.entities.iter().any(|e| e.name.eq_ignore_ascii_case(name))
    }
}

/// `local => source` inside an only-list. Without a rename both are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub local: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseStmt {
    pub module: String,
    /// `None` imports the whole module.
    pub only: Option<Vec<Rename>>,
}

impl UseStmt {
    pub fn imports(&self, name: &str) -> bool {
        match &self.only {
            None => false,
            Some(list) => list.iter().any(|r| r.local.eq_ignore_ascii_case(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecStatement {
    Declaration(Declaration),
    Use(UseStmt),
}

// ── Public API ──

/// Parse one specification line.
pub fn parse_statement(line: &str) -> GenResult<SpecStatement> {
    let lex_result = crate::lexer::lex(line);
    if let Some(err) = lex_result.errors.first() {
        return Err(GenError::usage(
            codes::MALFORMED_SPECIFICATION,
            format!("cannot tokenize specification '{}': {}", line.trim(), err.message),
        ));
    }
    let len = line.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = statement_parser(line);
    let (statement, errors) = parser.parse(stream).into_output_errors();
    match statement {
        Some(statement) if errors.is_empty() => Ok(statement),
        _ => {
            let detail = errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no output".to_string());
            Err(GenError::usage(
                codes::MALFORMED_SPECIFICATION,
                format!("cannot parse specification '{}': {}", line.trim(), detail),
            ))
        }
    }
}

/// Parse a line that must be a type declaration.
pub fn parse_declaration(line: &str) -> GenResult<Declaration> {
    match parse_statement(line)? {
        SpecStatement::Declaration(decl) => Ok(decl),
        SpecStatement::Use(_) => Err(GenError::usage(
            codes::MALFORMED_SPECIFICATION,
            format!("expected a declaration, found a use statement: '{}'", line.trim()),
        )),
    }
}

/// Parse a line as a use statement. Returns `None` for anything else.
pub fn parse_use(line: &str) -> Option<UseStmt> {
    match parse_statement(line) {
        Ok(SpecStatement::Use(stmt)) => Some(stmt),
        _ => None,
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `statement_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn statement_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, SpecStatement, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        source[span.start()..span.end()].to_string()
    });

    let keyword = move |word: &'static str| {
        just(Token::Ident).try_map(move |_, span: SimpleSpan| {
            if source[span.start()..span.end()].eq_ignore_ascii_case(word) {
                Ok(())
            } else {
                Err(Rich::custom(span, format!("expected `{}`", word)))
            }
        })
    };

    // ── Balanced parenthesised group ──

    let group = recursive(|group| {
        none_of([Token::LParen, Token::RParen])
            .ignored()
            .or(group)
            .repeated()
            .delimited_by(just(Token::LParen), just(Token::RParen))
    });

    // ── Type spec: real(8), character(len=*), real*8 ──

    let type_keyword = just(Token::Ident).try_map(move |_, span: SimpleSpan| {
        let word = &source[span.start()..span.end()];
        if TYPE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word)) {
            Ok(())
        } else {
            Err(Rich::custom(span, format!("`{}` is not a type", word)))
        }
    });

    let type_spec = type_keyword
        .then(group.clone().or_not())
        .then(just(Token::Star).then(any()).or_not())
        .map_with(move |_, e| {
            let span: SimpleSpan = e.span();
            source[span.start()..span.end()].to_string()
        });

    // ── Attribute: `, keyword[(args)]` ──

    let attribute = just(Token::Ident)
        .then(group.clone().or_not())
        .map_with(move |_, e| {
            let span: SimpleSpan = e.span();
            source[span.start()..span.end()].to_string()
        });

    let attributes = just(Token::Comma)
        .ignore_then(attribute)
        .repeated()
        .collect::<Vec<_>>();

    // ── Entity: name[(shape)][*len][ = init | => init] ──

    let init_expr = none_of([Token::Comma, Token::LParen, Token::RParen])
        .ignored()
        .or(group.clone())
        .repeated()
        .at_least(1);

    let entity = just(Token::Ident)
        .then(group.clone().or_not())
        .then(just(Token::Star).then(any()).or_not())
        .then(
            just(Token::Equals)
                .or(just(Token::Arrow))
                .then(init_expr)
                .or_not(),
        )
        .map_with(move |_, e| {
            let span: SimpleSpan = e.span();
            source[span.start()..span.end()].to_string()
        });

    let entity_list = entity
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .map_with(move |list, e| {
            let span: SimpleSpan = e.span();
            (list, source[span.start()..span.end()].to_string())
        });

    let declaration = type_spec
        .then(attributes)
        .then_ignore(just(Token::DoubleColon).or_not())
        .then(entity_list)
        .map(|((type_spec, attributes), (entities, entity_text))| Declaration {
            type_spec,
            attributes: attributes.iter().map(|a| split_attribute(a)).collect(),
            entities: entities.iter().map(|e| split_entity(e)).collect(),
            entity_text,
        });

    // ── Use statement: use m [, only: a [=> b], ...] ──

    let rename = ident
        .clone()
        .then(just(Token::Arrow).ignore_then(ident.clone()).or_not())
        .map(|(local, source_name)| Rename {
            source: source_name.unwrap_or_else(|| local.clone()),
            local,
        });

    let only_list = just(Token::Comma)
        .ignore_then(keyword("only"))
        .ignore_then(just(Token::Colon))
        .ignore_then(
            rename
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>(),
        );

    let use_stmt = keyword("use")
        .ignore_then(ident.clone())
        .then(only_list.or_not())
        .map(|(module, only)| UseStmt { module, only });

    use_stmt
        .map(SpecStatement::Use)
        .or(declaration.map(SpecStatement::Declaration))
        .then_ignore(end())
}

const TYPE_KEYWORDS: &[&str] = &[
    "real",
    "integer",
    "logical",
    "complex",
    "character",
    "double",
    "type",
    "class",
];

// ── Raw text helpers ──

/// Split `keyword(args)` into its lower-case keyword and the raw arguments.
fn split_attribute(text: &str) -> Attribute {
    let (name, args) = split_head(text);
    Attribute {
        name: name.to_ascii_lowercase(),
        args,
        text: text.trim().to_string(),
    }
}

fn split_entity(text: &str) -> Entity {
    let head_end = text
        .find(|c: char| c == '=' || c == '*')
        .unwrap_or(text.len());
    let (name, dims) = split_head(&text[..head_end]);
    Entity {
        name,
        dims,
        text: text.trim().to_string(),
    }
}

fn split_head(text: &str) -> (String, Option<String>) {
    let text = text.trim();
    match text.find('(') {
        Some(open) => {
            let close = text.rfind(')').unwrap_or(text.len());
            let args = if close > open {
                Some(text[open + 1..close].trim().to_string())
            } else {
                None
            };
            (text[..open].trim().to_string(), args)
        }
        None => (text.to_string(), None),
    }
}
