//! The document filter DSL (§6): a small boolean-predicate grammar over a
//! fixed column set, compiled once and reused both as an in-memory predicate
//! and as a SQL fragment pushed down to the columnar store.
//!
//! Grammar (case-insensitive keywords):
//!   expr       := or_expr
//!   or_expr    := and_expr (OR and_expr)*
//!   and_expr   := unary (AND unary)*
//!   unary      := NOT unary | atom
//!   atom       := '(' expr ')' | comparison
//!   comparison := field '=' literal
//!              |  field LIKE literal
//!              |  field IN '(' literal (',' literal)* ')'
//!              |  field IS [NOT] NULL
//!   field      := id | uri | title | created_at | updated_at | metadata.<key>
//!   literal    := 'single quoted string with '' escape' | number

use crate::error::CoreError;
use crate::types::Document;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Literal),
    Like(String, String),
    In(String, Vec<Literal>),
    IsNull(String),
    IsNotNull(String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn parse(src: &str) -> Result<Filter, CoreError> {
        let tokens = lex(src)?;
        let mut p = Parser { tokens, pos: 0 };
        let f = p.parse_or()?;
        if p.pos != p.tokens.len() {
            return Err(CoreError::FilterSyntax(format!(
                "unexpected trailing input near token {}",
                p.pos
            )));
        }
        Ok(f)
    }

    /// Evaluate the predicate against a document's fixed columns + metadata.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, lit) => field_value(doc, field)
                .map(|v| literal_eq(&v, lit))
                .unwrap_or(false),
            Filter::Like(field, pattern) => field_value(doc, field)
                .map(|v| like_match(&v, pattern))
                .unwrap_or(false),
            Filter::In(field, lits) => field_value(doc, field)
                .map(|v| lits.iter().any(|l| literal_eq(&v, l)))
                .unwrap_or(false),
            Filter::IsNull(field) => field_value(doc, field).is_none(),
            Filter::IsNotNull(field) => field_value(doc, field).is_some(),
            Filter::And(a, b) => a.matches(doc) && b.matches(doc),
            Filter::Or(a, b) => a.matches(doc) || b.matches(doc),
            Filter::Not(a) => !a.matches(doc),
        }
    }

    /// True if any leaf of the predicate reads a `metadata.*` field. The
    /// columnar store keeps document metadata as an opaque JSON blob, so
    /// such filters can't be pushed down as SQL and must be evaluated
    /// in-memory against a reconstructed [`Document`].
    pub fn references_metadata(&self) -> bool {
        match self {
            Filter::Eq(field, _) | Filter::Like(field, _) | Filter::In(field, _) => {
                field.starts_with("metadata.")
            }
            Filter::IsNull(field) | Filter::IsNotNull(field) => field.starts_with("metadata."),
            Filter::And(a, b) | Filter::Or(a, b) => a.references_metadata() || b.references_metadata(),
            Filter::Not(a) => a.references_metadata(),
        }
    }

    /// Render as a SQL-like predicate for pushdown to the store.
    pub fn to_sql(&self) -> String {
        match self {
            Filter::Eq(field, lit) => format!("{} = {}", field, sql_literal(lit)),
            Filter::Like(field, pat) => format!("{} LIKE '{}'", field, escape(pat)),
            Filter::In(field, lits) => {
                let items: Vec<String> = lits.iter().map(sql_literal).collect();
                format!("{} IN ({})", field, items.join(", "))
            }
            Filter::IsNull(field) => format!("{} IS NULL", field),
            Filter::IsNotNull(field) => format!("{} IS NOT NULL", field),
            Filter::And(a, b) => format!("({} AND {})", a.to_sql(), b.to_sql()),
            Filter::Or(a, b) => format!("({} OR {})", a.to_sql(), b.to_sql()),
            Filter::Not(a) => format!("NOT ({})", a.to_sql()),
        }
    }
}

fn sql_literal(lit: &Literal) -> String {
    match lit {
        Literal::Str(s) => format!("'{}'", escape(s)),
        Literal::Num(n) => n.to_string(),
    }
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

fn field_value(doc: &Document, field: &str) -> Option<String> {
    match field {
        "id" => Some(doc.document_id.clone()),
        "uri" => Some(doc.uri.clone()),
        "title" => doc.title.clone(),
        "created_at" => Some(doc.created_at.to_string()),
        "updated_at" => Some(doc.updated_at.to_string()),
        _ => field
            .strip_prefix("metadata.")
            .and_then(|key| doc.metadata.get(key))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
    }
}

fn literal_eq(value: &str, lit: &Literal) -> bool {
    match lit {
        Literal::Str(s) => value == s,
        Literal::Num(n) => value.parse::<f64>().map(|v| v == *n).unwrap_or(false),
    }
}

fn like_match(value: &str, pattern: &str) -> bool {
    let regex_src = format!(
        "^{}$",
        regex::escape(pattern)
            .replace("%", ".*")
            .replace('_', ".")
    );
    regex::Regex::new(&regex_src)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
    Eq,
    And,
    Or,
    Not,
    Like,
    In,
    Is,
    Null,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn lex(src: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(CoreError::FilterSyntax("unterminated string literal".into()));
                    }
                    if chars[i] == '\'' {
                        if i + 1 < chars.len() && chars[i + 1] == '\'' {
                            s.push('\'');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num: String = chars[start..i].iter().collect();
                let n = num
                    .parse::<f64>()
                    .map_err(|_| CoreError::FilterSyntax(format!("invalid number '{}'", num)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "LIKE" => Token::Like,
                    "IN" => Token::In,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(CoreError::FilterSyntax(format!("unexpected character '{}'", other)));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, t: &Token) -> Result<(), CoreError> {
        if self.peek() == Some(t) {
            self.pos += 1;
            Ok(())
        } else {
            Err(CoreError::FilterSyntax(format!(
                "expected {} at token {}",
                t, self.pos
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Filter, CoreError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Filter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Filter, CoreError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Filter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Filter, CoreError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Filter::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Filter, CoreError> {
        if self.peek() == Some(&Token::LParen) {
            self.advance();
            let inner = self.parse_or()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Filter, CoreError> {
        let field = match self.advance() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(CoreError::FilterSyntax(format!(
                    "expected field name, got {:?}",
                    other
                )))
            }
        };

        match self.peek() {
            Some(Token::Eq) => {
                self.advance();
                let lit = self.parse_literal()?;
                Ok(Filter::Eq(field, lit))
            }
            Some(Token::Like) => {
                self.advance();
                match self.parse_literal()? {
                    Literal::Str(s) => Ok(Filter::Like(field, s)),
                    Literal::Num(_) => Err(CoreError::FilterSyntax("LIKE requires a string literal".into())),
                }
            }
            Some(Token::In) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let mut lits = vec![self.parse_literal()?];
                while self.peek() == Some(&Token::Comma) {
                    self.advance();
                    lits.push(self.parse_literal()?);
                }
                self.expect(&Token::RParen)?;
                Ok(Filter::In(field, lits))
            }
            Some(Token::Is) => {
                self.advance();
                if self.peek() == Some(&Token::Not) {
                    self.advance();
                    self.expect(&Token::Null)?;
                    Ok(Filter::IsNotNull(field))
                } else {
                    self.expect(&Token::Null)?;
                    Ok(Filter::IsNull(field))
                }
            }
            other => Err(CoreError::FilterSyntax(format!(
                "expected comparison operator after field '{}', got {:?}",
                field, other
            ))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, CoreError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => Ok(Literal::Num(n)),
            other => Err(CoreError::FilterSyntax(format!(
                "expected literal, got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_references_metadata() {
        assert!(!Filter::parse("uri = 'a'").unwrap().references_metadata());
        assert!(Filter::parse("metadata.kind = 'pdf'").unwrap().references_metadata());
        assert!(Filter::parse("uri = 'a' AND metadata.kind = 'pdf'")
            .unwrap()
            .references_metadata());
    }

    fn doc(id: &str, uri: &str, title: Option<&str>) -> Document {
        Document {
            document_id: id.to_string(),
            uri: uri.to_string(),
            title: title.map(|s| s.to_string()),
            metadata: HashMap::new(),
            created_at: 100,
            updated_at: 200,
        }
    }

    #[test]
    fn test_equality() {
        let f = Filter::parse("uri = 'docs/a.md'").unwrap();
        assert!(f.matches(&doc("1", "docs/a.md", None)));
        assert!(!f.matches(&doc("1", "docs/b.md", None)));
    }

    #[test]
    fn test_like_pattern() {
        let f = Filter::parse("uri LIKE 'docs/%'").unwrap();
        assert!(f.matches(&doc("1", "docs/a.md", None)));
        assert!(!f.matches(&doc("1", "other/a.md", None)));
    }

    #[test]
    fn test_and_or_not_precedence() {
        let f = Filter::parse("uri = 'a' OR uri = 'b' AND NOT uri = 'c'").unwrap();
        assert!(f.matches(&doc("1", "a", None)));
        assert!(f.matches(&doc("1", "b", None)));
    }

    #[test]
    fn test_in_list() {
        let f = Filter::parse("id IN ('1', '2')").unwrap();
        assert!(f.matches(&doc("1", "x", None)));
        assert!(!f.matches(&doc("3", "x", None)));
    }

    #[test]
    fn test_is_null() {
        let f = Filter::parse("title IS NULL").unwrap();
        assert!(f.matches(&doc("1", "x", None)));
        assert!(!f.matches(&doc("1", "x", Some("t"))));
    }

    #[test]
    fn test_escaped_quote_in_literal() {
        let f = Filter::parse("uri = 'o''brien.md'").unwrap();
        assert!(f.matches(&doc("1", "o'brien.md", None)));
    }

    #[test]
    fn test_syntax_error_surfaces() {
        assert!(Filter::parse("uri ==").is_err());
    }
}
