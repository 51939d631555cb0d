//! Selector-level expression parsing.
//!
//! Understands number and string literals, vector selectors with label
//! matchers, range selectors (`sel[5m]`) and `offset` modifiers. This is
//! enough to back `match[]` parameters, `/format_query`, `/parse_query`
//! and the reference engine.

use crate::model::{
    format_compact_duration, format_float, parse_compact_duration, MatchType, Matcher, METRIC_NAME,
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// A parse failure with its position in the input.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{line}:{col}: parse error: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    pub matchers: Vec<Matcher>,
    /// Offset in milliseconds; positive looks into the past.
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    String(String),
    Vector(VectorSelector),
    Matrix {
        selector: VectorSelector,
        /// Range in milliseconds.
        range: i64,
    },
}

/// Parse a complete expression.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let mut p = Parser { input, pos: 0 };
    let expr = p.parse_expr()?;
    p.skip_ws();
    if let Some(c) = p.peek() {
        return Err(p.error(format!("unexpected character after expression: {:?}", c)));
    }
    Ok(expr)
}

/// Parse a bare metric selector such as `up{job="x"}` into its matchers.
pub fn parse_metric_selector(input: &str) -> Result<Vec<Matcher>, ParseError> {
    match parse(input)? {
        Expr::Vector(sel) if sel.offset == 0 => Ok(sel.matchers),
        _ => Err(ParseError {
            line: 1,
            col: 1,
            message: format!("expected a metric selector, got {:?}", input),
        }),
    }
}

impl Expr {
    /// Matcher sets of every selector in the expression.
    pub fn selectors(&self) -> Vec<Vec<Matcher>> {
        match self {
            Expr::Vector(sel) | Expr::Matrix { selector: sel, .. } => vec![sel.matchers.clone()],
            Expr::Number(_) | Expr::String(_) => Vec::new(),
        }
    }

    /// JSON rendering of the syntax tree.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Expr::Number(v) => json!({"type": "numberLiteral", "val": format_float(*v)}),
            Expr::String(s) => json!({"type": "stringLiteral", "val": s}),
            Expr::Vector(sel) => json!({
                "type": "vectorSelector",
                "name": sel.name.clone().unwrap_or_default(),
                "matchers": matchers_json(&sel.matchers),
                "offset": sel.offset,
                "timestamp": null,
                "startOrEnd": null,
            }),
            Expr::Matrix { selector, range } => json!({
                "type": "matrixSelector",
                "range": range,
                "name": selector.name.clone().unwrap_or_default(),
                "matchers": matchers_json(&selector.matchers),
                "offset": selector.offset,
                "timestamp": null,
                "startOrEnd": null,
            }),
        }
    }
}

fn matchers_json(matchers: &[Matcher]) -> serde_json::Value {
    matchers
        .iter()
        .map(|m| json!({"type": m.kind.to_string(), "name": m.name, "value": m.value}))
        .collect()
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest: Vec<&Matcher> = Vec::with_capacity(self.matchers.len());
        let mut skipped_name = false;
        for m in &self.matchers {
            let is_name = m.kind == MatchType::Equal
                && m.name == METRIC_NAME
                && self.name.as_deref() == Some(m.value.as_str());
            if is_name && !skipped_name {
                skipped_name = true;
                continue;
            }
            rest.push(m);
        }

        if let Some(name) = &self.name {
            write!(f, "{}", name)?;
        }
        if self.name.is_none() || !rest.is_empty() {
            let parts: Vec<String> = rest.iter().map(|m| m.to_string()).collect();
            write!(f, "{{{}}}", parts.join(", "))?;
        }
        Ok(())
    }
}

fn write_offset(f: &mut fmt::Formatter<'_>, offset: i64) -> fmt::Result {
    match offset {
        0 => Ok(()),
        o if o < 0 => write!(f, " offset -{}", format_compact_duration(-o)),
        o => write!(f, " offset {}", format_compact_duration(o)),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(v) => write!(f, "{}", format_float(*v)),
            Expr::String(s) => write!(f, "{:?}", s),
            Expr::Vector(sel) => {
                write!(f, "{}", sel)?;
                write_offset(f, sel.offset)
            }
            Expr::Matrix { selector, range } => {
                write!(f, "{}[{}]", selector, format_compact_duration(*range))?;
                write_offset(f, selector.offset)
            }
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.input[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while !matches!(self.bump(), None | Some('\n')) {}
                }
                _ => return,
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let before = &self.input[..self.pos];
        let line = before.matches('\n').count() + 1;
        let col = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
        ParseError {
            line,
            col,
            message: message.into(),
        }
    }

    fn take_while(&mut self, mut pred: impl FnMut(char) -> bool) -> &'a str {
        let input = self.input;
        let start = self.pos;
        while self.peek().is_some_and(&mut pred) {
            self.bump();
        }
        &input[start..self.pos]
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.skip_ws();
        let expr = match self.peek() {
            None => return Err(self.error("no expression found in input")),
            Some('"' | '\'' | '`') => Expr::String(self.parse_string()?),
            Some(c) if c.is_ascii_digit() || c == '.' || c == '+' || c == '-' => {
                Expr::Number(self.parse_number()?)
            }
            Some('{') => Expr::Vector(self.parse_selector(None)?),
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
                let ident = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
                match ident.to_ascii_lowercase().as_str() {
                    "inf" => Expr::Number(f64::INFINITY),
                    "nan" => Expr::Number(f64::NAN),
                    _ => Expr::Vector(self.parse_selector(Some(ident.to_string()))?),
                }
            }
            Some(c) => return Err(self.error(format!("unexpected character: {:?}", c))),
        };

        let Expr::Vector(mut selector) = expr else {
            return Ok(expr);
        };

        self.skip_ws();
        let range = if self.eat("[") {
            let raw = self.take_while(|c| c != ']');
            if !self.eat("]") {
                return Err(self.error("unclosed left bracket"));
            }
            let range = parse_compact_duration(raw.trim())
                .map_err(|e| self.error(format!("bad number or duration syntax: {}", e)))?;
            if range.num_milliseconds() <= 0 {
                return Err(self.error("range duration must be greater than 0"));
            }
            Some(range.num_milliseconds())
        } else {
            None
        };

        self.skip_ws();
        let input = self.input;
        let rest = &input[self.pos..];
        if rest.starts_with("offset")
            && !rest[6..].starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 6;
            self.skip_ws();
            let negative = self.eat("-");
            let raw = self.take_while(|c| c.is_ascii_alphanumeric());
            let d = parse_compact_duration(raw)
                .map_err(|e| self.error(format!("bad number or duration syntax: {}", e)))?;
            let ms = d.num_milliseconds();
            selector.offset = if negative { -ms } else { ms };
        }

        Ok(match range {
            Some(range) => Expr::Matrix { selector, range },
            None => Expr::Vector(selector),
        })
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
        let negative = match self.peek() {
            Some('-') => {
                self.bump();
                true
            }
            Some('+') => {
                self.bump();
                false
            }
            _ => false,
        };

        let mut prev = ' ';
        let body = self.take_while(|c| {
            let ok = c.is_ascii_alphanumeric()
                || c == '.'
                || ((c == '+' || c == '-') && (prev == 'e' || prev == 'E'));
            prev = c;
            ok
        });

        let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok().map(|v| v as f64)
        } else {
            body.parse::<f64>().ok()
        };

        match value {
            Some(v) if negative => Ok(-v),
            Some(v) => Ok(v),
            None => Err(ParseError {
                message: format!(
                    "bad number or duration syntax: {:?}",
                    &self.input[start..self.pos]
                ),
                ..self.error("")
            }),
        }
    }

    fn parse_string(&mut self) -> Result<String, ParseError> {
        let quote = self.bump().unwrap_or('"');
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated quoted string"));
            };
            if c == quote {
                return Ok(out);
            }
            if c != '\\' || quote == '`' {
                out.push(c);
                continue;
            }
            let Some(esc) = self.bump() else {
                return Err(self.error("unterminated quoted string"));
            };
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'a' => out.push('\u{7}'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                'v' => out.push('\u{b}'),
                '\\' | '"' | '\'' => out.push(esc),
                'x' | 'u' | 'U' => {
                    let width = match esc {
                        'x' => 2,
                        'u' => 4,
                        _ => 8,
                    };
                    let mut hex = String::with_capacity(width);
                    for _ in 0..width {
                        match self.bump() {
                            Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                            _ => return Err(self.error("invalid escape sequence")),
                        }
                    }
                    let decoded = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32);
                    match decoded {
                        Some(ch) => out.push(ch),
                        None => return Err(self.error("invalid escape sequence")),
                    }
                }
                other => {
                    return Err(self.error(format!("unknown escape sequence {:?}", other)));
                }
            }
        }
    }

    fn parse_selector(&mut self, name: Option<String>) -> Result<VectorSelector, ParseError> {
        let mut name = name;
        let mut matchers = Vec::new();

        self.skip_ws();
        if self.eat("{") {
            loop {
                self.skip_ws();
                if self.eat("}") {
                    break;
                }

                let (label, quoted) = match self.peek() {
                    Some('"' | '\'') => (self.parse_string()?, true),
                    Some(c) if c.is_ascii_alphabetic() || c == '_' => (
                        self.take_while(|c| c.is_ascii_alphanumeric() || c == '_')
                            .to_string(),
                        false,
                    ),
                    _ => return Err(self.error("unexpected character inside braces")),
                };
                self.skip_ws();

                // A lone quoted string names the metric.
                if quoted && matches!(self.peek(), Some(',' | '}')) {
                    if name.is_some() {
                        return Err(self.error(format!(
                            "metric name must not be set twice: {:?}",
                            label
                        )));
                    }
                    name = Some(label);
                } else {
                    let kind = if self.eat("=~") {
                        MatchType::Regex
                    } else if self.eat("!~") {
                        MatchType::NotRegex
                    } else if self.eat("!=") {
                        MatchType::NotEqual
                    } else if self.eat("=") {
                        MatchType::Equal
                    } else {
                        return Err(self.error(format!(
                            "unexpected character in label matching after {:?}",
                            label
                        )));
                    };
                    self.skip_ws();
                    if !matches!(self.peek(), Some('"' | '\'' | '`')) {
                        return Err(self.error("unexpected token in label matching, expected string"));
                    }
                    let value = self.parse_string()?;
                    let matcher = Matcher::new(kind, label, value)
                        .map_err(|e| self.error(format!("invalid regular expression: {}", e)))?;
                    matchers.push(matcher);
                }

                self.skip_ws();
                if self.eat(",") {
                    continue;
                }
                if self.eat("}") {
                    break;
                }
                return Err(self.error(r#"unexpected character in label matching, expected "," or "}""#));
            }
        }

        if let Some(n) = &name {
            if matchers.iter().any(|m| m.name == METRIC_NAME) {
                return Err(self.error(format!("metric name must not be set twice: {:?}", n)));
            }
            if n.is_empty() {
                return Err(self.error("metric name must not be empty"));
            }
            matchers.insert(0, Matcher::equal(METRIC_NAME, n.clone()));
        }

        if !matchers.iter().any(|m| !m.matches("")) {
            return Err(self.error("vector selector must contain at least one non-empty matcher"));
        }

        Ok(VectorSelector {
            name,
            matchers,
            offset: 0,
        })
    }
}

/// Canonical rendering of a query string.
pub fn pretty(input: &str) -> Result<String, ParseError> {
    parse(input).map(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector_selector() {
        let expr = parse(r#"up{job="x", instance=~"a.*"}"#).unwrap();
        let Expr::Vector(sel) = expr else {
            panic!("expected vector selector");
        };
        assert_eq!(sel.name.as_deref(), Some("up"));
        assert_eq!(sel.matchers.len(), 3);
        assert_eq!(sel.matchers[0], Matcher::equal(METRIC_NAME, "up"));
        assert_eq!(sel.matchers[2].kind, MatchType::Regex);
    }

    #[test]
    fn test_parse_matrix_with_offset() {
        let expr = parse("http_requests_total[5m] offset 1h").unwrap();
        match expr {
            Expr::Matrix { selector, range } => {
                assert_eq!(range, 300_000);
                assert_eq!(selector.offset, 3_600_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("1.5").unwrap(), Expr::Number(1.5));
        assert_eq!(parse("-2").unwrap(), Expr::Number(-2.0));
        assert_eq!(parse("0x10").unwrap(), Expr::Number(16.0));
        assert_eq!(parse(r#""a\nb""#).unwrap(), Expr::String("a\nb".to_string()));
        assert_eq!(parse(r"`a\nb`").unwrap(), Expr::String(r"a\nb".to_string()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("up{").is_err());
        assert!(parse("up{job=x}").is_err());
        assert!(parse("up[5m").is_err());
        assert!(parse("up foo").is_err());

        let err = parse(r#"{job=""}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "1:9: parse error: vector selector must contain at least one non-empty matcher"
        );
    }

    #[test]
    fn test_pretty() {
        assert_eq!(pretty(r#"up{job="x",le!="1"}"#).unwrap(), r#"up{job="x", le!="1"}"#);
        assert_eq!(pretty("  up  ").unwrap(), "up");
        assert_eq!(pretty("up[90s] offset 1m").unwrap(), "up[1m30s] offset 1m");
        assert_eq!(pretty(r#"{__name__="up"}"#).unwrap(), r#"{__name__="up"}"#);
    }

    #[test]
    fn test_quoted_metric_name() {
        let sel = parse_metric_selector(r#"{"my.metric", job="x"}"#).unwrap();
        assert_eq!(sel[0], Matcher::equal(METRIC_NAME, "my.metric"));
    }

    #[test]
    fn test_to_json() {
        let ast = parse(r#"up{job="x"}"#).unwrap().to_json();
        assert_eq!(ast["type"], "vectorSelector");
        assert_eq!(ast["name"], "up");
        assert_eq!(ast["matchers"][1]["type"], "=");
        assert_eq!(ast["matchers"][1]["value"], "x");
    }

    #[test]
    fn test_selectors() {
        assert_eq!(parse("up[5m]").unwrap().selectors().len(), 1);
        assert!(parse("1").unwrap().selectors().is_empty());
    }
}
