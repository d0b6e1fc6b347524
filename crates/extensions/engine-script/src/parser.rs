//! Tokenizer and parser for the script language.

use kernelhive_protocols::ErrorInfo;

/// A lexical token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Plus,
    Assign,
}

/// An expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Int(i64),
    Str(String),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
}

/// A statement tagged with its source line (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtKind {
    Let(String, Expr),
    Print(Expr),
    Eprint(Expr),
    Sleep(Expr),
    Repeat {
        count: Expr,
        var: Option<String>,
        body: Vec<Stmt>,
    },
    Raise {
        ename: String,
        message: Option<Expr>,
    },
    Display {
        mime: String,
        value: Expr,
        display_id: Option<String>,
    },
    Update {
        display_id: String,
        mime: String,
        value: Expr,
    },
    Panic(Expr),
    Expr(Expr),
}

/// Parse a program.
pub fn parse(source: &str) -> Result<Vec<Stmt>, ErrorInfo> {
    let mut lines = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        lines.push((idx + 1, tokenize(text, idx + 1)?));
    }

    let mut pos = 0;
    let body = parse_block(&lines, &mut pos, false)?;
    Ok(body)
}

fn parse_block(
    lines: &[(usize, Vec<Token>)],
    pos: &mut usize,
    nested: bool,
) -> Result<Vec<Stmt>, ErrorInfo> {
    let mut stmts = Vec::new();

    while *pos < lines.len() {
        let (line, tokens) = &lines[*pos];
        *pos += 1;

        if matches!(tokens.first(), Some(Token::Ident(kw)) if kw == "end") {
            if !nested {
                return Err(syntax_error(*line, "'end' without matching 'repeat'"));
            }
            return Ok(stmts);
        }

        let kind = parse_statement(*line, tokens, lines, pos)?;
        stmts.push(Stmt { line: *line, kind });
    }

    if nested {
        let last = lines.last().map(|(l, _)| *l).unwrap_or(0);
        return Err(syntax_error(last, "'repeat' block is missing 'end'"));
    }
    Ok(stmts)
}

fn parse_statement(
    line: usize,
    tokens: &[Token],
    lines: &[(usize, Vec<Token>)],
    pos: &mut usize,
) -> Result<StmtKind, ErrorInfo> {
    let keyword = match tokens.first() {
        Some(Token::Ident(kw)) => kw.as_str(),
        _ => return Ok(StmtKind::Expr(parse_expr(line, tokens)?)),
    };
    let rest = &tokens[1..];

    let kind = match keyword {
        "let" => match rest {
            [Token::Ident(name), Token::Assign, expr @ ..] => {
                StmtKind::Let(name.clone(), parse_expr(line, expr)?)
            }
            _ => return Err(syntax_error(line, "expected 'let <name> = <expr>'")),
        },
        "print" => StmtKind::Print(parse_expr(line, rest)?),
        "eprint" => StmtKind::Eprint(parse_expr(line, rest)?),
        "sleep" => StmtKind::Sleep(parse_expr(line, rest)?),
        "panic" => StmtKind::Panic(parse_expr(line, rest)?),
        "raise" => match rest {
            [Token::Ident(ename)] => StmtKind::Raise {
                ename: ename.clone(),
                message: None,
            },
            [Token::Ident(ename), expr @ ..] => StmtKind::Raise {
                ename: ename.clone(),
                message: Some(parse_expr(line, expr)?),
            },
            _ => return Err(syntax_error(line, "expected 'raise <Name> [message]'")),
        },
        "repeat" => {
            let (count_tokens, var) = split_alias(rest);
            let count = parse_expr(line, count_tokens)?;
            let body = parse_block(lines, pos, true)?;
            StmtKind::Repeat { count, var, body }
        }
        "display" => match rest {
            [Token::Ident(mime), value @ ..] => {
                let (value_tokens, display_id) = split_alias(value);
                StmtKind::Display {
                    mime: expand_mime(mime),
                    value: parse_expr(line, value_tokens)?,
                    display_id,
                }
            }
            _ => return Err(syntax_error(line, "expected 'display <mime> <expr> [as <id>]'")),
        },
        "update" => match rest {
            [Token::Ident(id), Token::Ident(mime), value @ ..] => StmtKind::Update {
                display_id: id.clone(),
                mime: expand_mime(mime),
                value: parse_expr(line, value)?,
            },
            _ => return Err(syntax_error(line, "expected 'update <id> <mime> <expr>'")),
        },
        _ => StmtKind::Expr(parse_expr(line, tokens)?),
    };

    Ok(kind)
}

/// Split a trailing `as <name>` off a token list.
fn split_alias(tokens: &[Token]) -> (&[Token], Option<String>) {
    match tokens {
        [head @ .., Token::Ident(kw), Token::Ident(name)] if kw == "as" => {
            (head, Some(name.clone()))
        }
        _ => (tokens, None),
    }
}

fn expand_mime(short: &str) -> String {
    match short {
        "text" | "plain" => "text/plain".to_string(),
        "html" => "text/html".to_string(),
        "png" => "image/png".to_string(),
        other => other.to_string(),
    }
}

fn parse_expr(line: usize, tokens: &[Token]) -> Result<Expr, ErrorInfo> {
    if tokens.is_empty() {
        return Err(syntax_error(line, "expected an expression"));
    }

    let mut iter = tokens.iter();
    let mut expr = parse_term(line, iter.next())?;
    while let Some(token) = iter.next() {
        if *token != Token::Plus {
            return Err(syntax_error(line, format!("unexpected token {:?}", token)));
        }
        let rhs = parse_term(line, iter.next())?;
        expr = Expr::Add(Box::new(expr), Box::new(rhs));
    }
    Ok(expr)
}

fn parse_term(line: usize, token: Option<&Token>) -> Result<Expr, ErrorInfo> {
    match token {
        Some(Token::Int(n)) => Ok(Expr::Int(*n)),
        Some(Token::Str(s)) => Ok(Expr::Str(s.clone())),
        Some(Token::Ident(name)) => Ok(Expr::Var(name.clone())),
        Some(other) => Err(syntax_error(line, format!("unexpected token {:?}", other))),
        None => Err(syntax_error(line, "expression ends unexpectedly")),
    }
}

/// Split one line into tokens.
pub fn tokenize(text: &str, line: usize) -> Result<Vec<Token>, ErrorInfo> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '#' {
            break;
        } else if c == '+' {
            tokens.push(Token::Plus);
            i += 1;
        } else if c == '=' {
            tokens.push(Token::Assign);
            i += 1;
        } else if c == '"' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(syntax_error(line, "unterminated string literal")),
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            _ => return Err(syntax_error(line, "invalid escape sequence")),
                        }
                        i += 2;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
        } else if c.is_ascii_digit()
            || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<i64>()
                .map_err(|_| syntax_error(line, format!("integer literal out of range: {}", literal)))?;
            tokens.push(Token::Int(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '/' | '-'))
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            return Err(syntax_error(line, format!("unexpected character '{}'", c)));
        }
    }

    Ok(tokens)
}

fn syntax_error(line: usize, message: impl Into<String>) -> ErrorInfo {
    ErrorInfo::new("SyntaxError", message).with_traceback(vec![format!("line {}", line)])
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
