//! Prototype schema extraction from C headers
//!
//! Parses a restricted C declaration grammar (typedefs plus function
//! declarations with pointer/array declarators) out of one or more header
//! sources and assembles the API [`Schema`]. There is no preprocessor:
//! directives are blanked out, comments stripped, and stand-in typedefs are
//! injected for the scalar types the headers take from `<stdint.h>` and
//! `<stdbool.h>`.
//!
//! `type * /* owning */ name` annotations are scanned from the raw text
//! before comment stripping, since the marker itself is a comment. The marker
//! sits between the return declarator and the function name, so the captured
//! word is the function name.

use crate::schema::{Argument, Function, ReturnType, Schema, BUILTIN_SCALARS};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

/// Errors produced while parsing header declarations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: unexpected character `{ch}`")]
    UnexpectedChar { line: usize, ch: char },

    #[error("line {line}: unexpected token `{token}`")]
    UnexpectedToken { line: usize, token: String },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("line {line}: declaration has no name")]
    MissingDeclarationName { line: usize },

    #[error("line {line}: parameter has no name")]
    MissingParameterName { line: usize },
}

/// Stand-ins for scalar types the parser has no preprocessor to resolve.
const FIXUP_TYPEDEFS: &str = "\
typedef struct bool bool;
typedef struct uint8_t uint8_t;
typedef struct uint32_t uint32_t;
typedef struct uint64_t uint64_t;
";

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?sm)/\*.*?\*/|//([^\n\\]|\\.)*?$").expect("comment regex")
});

static OWNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/\*\s*owning\s*\*/\s*(\w+)").expect("owning regex")
});

/// Extract the API schema from the given header texts.
pub fn extract(headers: &[&str]) -> Result<Schema, ParseError> {
    let mut text = String::from(FIXUP_TYPEDEFS);
    for header in headers {
        text.push_str(header);
    }

    let owning = owning_functions(&text);
    let cleaned = blank_directives(&strip_comments(&text));

    let mut parser = Parser::new(tokenize(&cleaned)?);
    let declarations = parser.translation_unit()?;

    let mut functions = Vec::new();
    let mut opaque_candidates = Vec::new();
    for declaration in declarations {
        match declaration {
            Declaration::Typedef(name) => {
                if !BUILTIN_SCALARS.contains(&name.as_str()) {
                    opaque_candidates.push(name);
                }
            }
            Declaration::Function {
                name,
                arguments,
                return_type,
            } => {
                let owning = owning.contains(&name);
                functions.push(Function {
                    name,
                    arguments,
                    return_type: ReturnType::new(return_type, owning),
                });
            }
        }
    }

    tracing::debug!(
        functions = functions.len(),
        opaque_candidates = opaque_candidates.len(),
        "extracted prototype schema"
    );
    Ok(Schema::new(functions, opaque_candidates))
}

/// Function names annotated with a `/* owning */` comment. Must run on the raw
/// text, before comment stripping.
fn owning_functions(text: &str) -> HashSet<String> {
    OWNING_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Remove block and line comments, preserving line structure where possible.
fn strip_comments(text: &str) -> String {
    COMMENT_RE
        .replace_all(text, |caps: &regex::Captures| {
            // Keep the newlines of multi-line block comments so later
            // diagnostics still point at the right line.
            caps[0].chars().filter(|c| *c == '\n').collect::<String>()
        })
        .into_owned()
}

/// Blank out preprocessor lines. Directives are discarded, never interpreted.
fn blank_directives(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !line.starts_with('#') {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Star,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semi,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(name) => name.clone(),
            Tok::Star => "*".to_string(),
            Tok::LParen => "(".to_string(),
            Tok::RParen => ")".to_string(),
            Tok::LBracket => "[".to_string(),
            Tok::RBracket => "]".to_string(),
            Tok::Comma => ",".to_string(),
            Tok::Semi => ";".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    tok: Tok::Ident(ident),
                    line,
                });
            }
            _ => {
                let tok = match c {
                    '*' => Tok::Star,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ',' => Tok::Comma,
                    ';' => Tok::Semi,
                    other => return Err(ParseError::UnexpectedChar { line, ch: other }),
                };
                chars.next();
                tokens.push(Token { tok, line });
            }
        }
    }
    Ok(tokens)
}

/// Render a type token sequence the way the schema spells types:
/// space-separated words, `*` as its own word (`const char *`, `rp_manager *`).
fn render_type(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.tok.describe())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug)]
enum Declaration {
    Typedef(String),
    Function {
        name: String,
        arguments: Vec<Argument>,
        return_type: String,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ParseError::UnexpectedEof)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Tok) -> Result<Token, ParseError> {
        let token = self.next()?;
        if &token.tok == expected {
            Ok(token)
        } else {
            Err(ParseError::UnexpectedToken {
                line: token.line,
                token: token.tok.describe(),
            })
        }
    }

    fn translation_unit(&mut self) -> Result<Vec<Declaration>, ParseError> {
        let mut declarations = Vec::new();
        while let Some(token) = self.peek() {
            match &token.tok {
                Tok::Ident(name) if name == "typedef" => {
                    declarations.push(self.typedef_declaration()?);
                }
                _ => declarations.push(self.function_declaration()?),
            }
        }
        Ok(declarations)
    }

    /// `typedef [struct] IDENT IDENT ;`
    fn typedef_declaration(&mut self) -> Result<Declaration, ParseError> {
        let keyword = self.next()?;
        let mut last_ident = None;
        loop {
            let token = self.next()?;
            match token.tok {
                Tok::Semi => break,
                Tok::Ident(name) => last_ident = Some(name),
                Tok::Star => {}
                other => {
                    return Err(ParseError::UnexpectedToken {
                        line: token.line,
                        token: other.describe(),
                    })
                }
            }
        }
        let name = last_ident.ok_or(ParseError::MissingDeclarationName {
            line: keyword.line,
        })?;
        Ok(Declaration::Typedef(name))
    }

    /// `type-tokens NAME ( parameters ) ;`. The declarator name is the last
    /// identifier before the parameter list, which handles pointer and
    /// non-pointer return shapes uniformly.
    fn function_declaration(&mut self) -> Result<Declaration, ParseError> {
        let mut head = Vec::new();
        loop {
            let token = self.next()?;
            match token.tok {
                Tok::LParen => break,
                Tok::Ident(_) | Tok::Star => head.push(token),
                other => {
                    return Err(ParseError::UnexpectedToken {
                        line: token.line,
                        token: other.describe(),
                    })
                }
            }
        }

        let name_token = head.pop().ok_or(ParseError::UnexpectedEof)?;
        let name = match name_token.tok {
            Tok::Ident(name) => name,
            _ => {
                return Err(ParseError::MissingDeclarationName {
                    line: name_token.line,
                })
            }
        };
        if head.is_empty() {
            return Err(ParseError::MissingDeclarationName {
                line: name_token.line,
            });
        }
        let return_type = render_type(&head);

        let arguments = self.parameter_list()?;
        self.expect(&Tok::Semi)?;
        Ok(Declaration::Function {
            name,
            arguments,
            return_type,
        })
    }

    fn parameter_list(&mut self) -> Result<Vec<Argument>, ParseError> {
        let mut parameters: Vec<Vec<Token>> = Vec::new();
        let mut current: Vec<Token> = Vec::new();
        loop {
            let token = self.next()?;
            match token.tok {
                Tok::RParen => {
                    if !current.is_empty() {
                        parameters.push(current);
                    }
                    break;
                }
                Tok::Comma => {
                    parameters.push(std::mem::take(&mut current));
                }
                Tok::Ident(_) | Tok::Star | Tok::LBracket | Tok::RBracket => {
                    current.push(token);
                }
                other => {
                    return Err(ParseError::UnexpectedToken {
                        line: token.line,
                        token: other.describe(),
                    })
                }
            }
        }

        // `f(void)` and `f()` both declare no parameters
        if parameters.len() == 1
            && parameters[0].len() == 1
            && parameters[0][0].tok == Tok::Ident("void".to_string())
        {
            return Ok(Vec::new());
        }

        parameters.into_iter().map(parse_parameter).collect()
    }
}

/// Decompose one parameter's tokens into name + type spelling. The name is the
/// trailing identifier; a trailing `[]` is preserved as the array marker.
fn parse_parameter(mut tokens: Vec<Token>) -> Result<Argument, ParseError> {
    let line = tokens.first().map(|t| t.line).unwrap_or(0);

    let mut array = false;
    if tokens.len() >= 2
        && tokens[tokens.len() - 2].tok == Tok::LBracket
        && tokens[tokens.len() - 1].tok == Tok::RBracket
    {
        array = true;
        tokens.truncate(tokens.len() - 2);
    }

    let name_token = tokens.pop().ok_or(ParseError::MissingParameterName { line })?;
    let name = match name_token.tok {
        Tok::Ident(name) => name,
        _ => return Err(ParseError::MissingParameterName { line }),
    };
    if tokens.is_empty() {
        return Err(ParseError::MissingParameterName { line });
    }

    let mut type_ = render_type(&tokens);
    if array {
        if type_.ends_with('*') {
            type_.push_str("[]");
        } else {
            type_.push_str(" []");
        }
    }
    Ok(Argument::new(name, type_))
}
