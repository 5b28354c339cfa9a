//! Tag filter algebra
//!
//! Sessions select upstreams by tag. Three shapes are supported: a plain tag
//! list (OR), a boolean expression over tags (`and`/`or`/`not` with
//! parentheses, `&&`/`||`/`!` accepted as aliases), and a JSON query DSL
//! (`{"$and": […]}`, `{"$or": […]}`, `{"$not": …}`, `{"tag": …}`).

use serde_json::Value;

use crate::error::{ProxyError, ProxyResult};

/// A parsed boolean tag expression
#[derive(Debug, Clone, PartialEq)]
pub enum TagExpr {
    Tag(String),
    And(Box<TagExpr>, Box<TagExpr>),
    Or(Box<TagExpr>, Box<TagExpr>),
    Not(Box<TagExpr>),
}

impl TagExpr {
    /// Parse an expression like `web and (fast or not legacy)`
    pub fn parse(input: &str) -> ProxyResult<TagExpr> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, at: 0 };
        let expr = parser.or_expr()?;
        if parser.at != parser.tokens.len() {
            return Err(ProxyError::invalid_params(format!(
                "unexpected trailing input in tag expression '{}'",
                input
            )));
        }
        Ok(expr)
    }

    /// Evaluate against an upstream's tag set
    pub fn matches(&self, tags: &[String]) -> bool {
        match self {
            TagExpr::Tag(tag) => tags.iter().any(|have| have == tag),
            TagExpr::And(a, b) => a.matches(tags) && b.matches(tags),
            TagExpr::Or(a, b) => a.matches(tags) || b.matches(tags),
            TagExpr::Not(inner) => !inner.matches(tags),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(input: &str) -> ProxyResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' | '|' => {
                chars.next();
                if chars.peek() == Some(&c) {
                    chars.next();
                    tokens.push(if c == '&' { Token::And } else { Token::Or });
                } else {
                    return Err(ProxyError::invalid_params(format!(
                        "single '{}' in tag expression",
                        c
                    )));
                }
            }
            c if is_tag_char(c) => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if is_tag_char(c) {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(ProxyError::invalid_params(format!(
                    "unexpected character '{}' in tag expression",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.at).cloned();
        if token.is_some() {
            self.at += 1;
        }
        token
    }

    fn or_expr(&mut self) -> ProxyResult<TagExpr> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and_expr()?;
            left = TagExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ProxyResult<TagExpr> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.unary()?;
            left = TagExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> ProxyResult<TagExpr> {
        match self.next() {
            Some(Token::Not) => Ok(TagExpr::Not(Box::new(self.unary()?))),
            Some(Token::Open) => {
                let inner = self.or_expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(ProxyError::invalid_params(
                        "unbalanced parenthesis in tag expression",
                    )),
                }
            }
            Some(Token::Ident(tag)) => Ok(TagExpr::Tag(tag)),
            other => Err(ProxyError::invalid_params(format!(
                "expected tag, got {:?}",
                other
            ))),
        }
    }
}

/// Validate the shape of a JSON tag query without evaluating it
pub fn validate_tag_query(query: &Value) -> ProxyResult<()> {
    evaluate_tag_query(query, &[]).map(|_| ())
}

/// Evaluate a JSON tag query against an upstream's tag set
pub fn evaluate_tag_query(query: &Value, tags: &[String]) -> ProxyResult<bool> {
    match query {
        Value::String(tag) => Ok(tags.iter().any(|have| have == tag)),
        Value::Object(map) => {
            if map.len() != 1 {
                return Err(ProxyError::invalid_params(
                    "tag query objects take exactly one key",
                ));
            }
            let (key, value) = map.iter().next().expect("len checked");
            match key.as_str() {
                "tag" => match value {
                    Value::String(tag) => Ok(tags.iter().any(|have| have == tag)),
                    _ => Err(ProxyError::invalid_params("\"tag\" takes a string")),
                },
                "$and" => {
                    let clauses = value.as_array().ok_or_else(|| {
                        ProxyError::invalid_params("\"$and\" takes an array")
                    })?;
                    let mut all = true;
                    for clause in clauses {
                        all &= evaluate_tag_query(clause, tags)?;
                    }
                    Ok(all)
                }
                "$or" => {
                    let clauses = value.as_array().ok_or_else(|| {
                        ProxyError::invalid_params("\"$or\" takes an array")
                    })?;
                    let mut any = false;
                    for clause in clauses {
                        any |= evaluate_tag_query(clause, tags)?;
                    }
                    Ok(any)
                }
                "$not" => Ok(!evaluate_tag_query(value, tags)?),
                other => Err(ProxyError::invalid_params(format!(
                    "unknown tag query operator '{}'",
                    other
                ))),
            }
        }
        _ => Err(ProxyError::invalid_params(
            "tag query must be a string or object",
        )),
    }
}
