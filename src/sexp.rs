use std::fmt;

use crate::error::{ProtocolSnafu, Result};

/// A printable s-expression value, the unit of framing on the wire.
///
/// `nil` doubles as the empty list and as boolean false; `t` is boolean
/// true by convention. Byte strings never appear directly: they are carried
/// as Base64 in `Str` values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Sym(String),
    Int(i64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn sym(s: impl Into<String>) -> Value {
        Value::Sym(s.into())
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn int(i: impl Into<i64>) -> Value {
        Value::Int(i.into())
    }

    pub fn bool(b: bool) -> Value {
        if b {
            Value::Sym("t".into())
        } else {
            Value::Nil
        }
    }

    pub fn list(items: Vec<Value>) -> Value {
        if items.is_empty() {
            Value::Nil
        } else {
            Value::List(items)
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil)
    }
}

/// Reads exactly one complete form from the front of `input`.
///
/// Returns the value and the number of bytes consumed, `Ok(None)` when the
/// input holds only an incomplete prefix of a form (the caller keeps the
/// bytes and waits for more), or an error for input that can never become a
/// valid form.
pub fn read_one(input: &str) -> Result<Option<(Value, usize)>> {
    let mut p = Parser {
        input,
        bytes: input.as_bytes(),
        pos: 0,
    };
    p.skip_whitespace();
    if p.at_end() {
        return Ok(None);
    }
    match p.value()? {
        Some(v) => Ok(Some((v, p.pos))),
        None => Ok(None),
    }
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn fail<T>(&self, detail: impl Into<String>) -> Result<T> {
        ProtocolSnafu {
            detail: detail.into(),
        }
        .fail()
    }

    /// One value, or `None` when the input ran out mid-form.
    fn value(&mut self) -> Result<Option<Value>> {
        match self.peek() {
            None => Ok(None),
            Some(b'(') => self.list(),
            Some(b')') => self.fail("unbalanced close paren"),
            Some(b'"') => self.string(),
            Some(_) => self.atom(),
        }
    }

    fn list(&mut self) -> Result<Option<Value>> {
        self.pos += 1; // consume '('
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Ok(None),
                Some(b')') => {
                    self.pos += 1;
                    return Ok(Some(Value::list(items)));
                }
                Some(b'.') if self.dot_is_delimited() => {
                    self.pos += 1;
                    self.skip_whitespace();
                    match self.value()? {
                        None => return Ok(None),
                        Some(tail) => {
                            items.push(tail);
                            self.skip_whitespace();
                            match self.peek() {
                                None => return Ok(None),
                                Some(b')') => {
                                    self.pos += 1;
                                    return Ok(Some(Value::list(items)));
                                }
                                Some(_) => return self.fail("malformed dotted tail"),
                            }
                        }
                    }
                }
                Some(_) => match self.value()? {
                    None => return Ok(None),
                    Some(v) => items.push(v),
                },
            }
        }
    }

    /// A `.` only acts as the pair separator when it stands alone.
    fn dot_is_delimited(&self) -> bool {
        match self.bytes.get(self.pos + 1) {
            None => true,
            Some(b) => matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'(' | b')' | b'"'),
        }
    }

    fn string(&mut self) -> Result<Option<Value>> {
        let start = self.pos + 1;
        let mut i = start;
        let b = self.bytes;
        while i < b.len() {
            match b[i] {
                b'"' => {
                    let raw = &self.input[start..i];
                    self.pos = i + 1;
                    return Ok(Some(Value::Str(unescape(raw)?)));
                }
                b'\\' => {
                    if i + 1 >= b.len() {
                        return Ok(None);
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }
        Ok(None)
    }

    fn atom(&mut self) -> Result<Option<Value>> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'(' | b')' | b'"') {
                break;
            }
            self.pos += 1;
        }
        // an atom at the very end of the buffer may still be growing
        if self.at_end() {
            self.pos = start;
            return Ok(None);
        }
        let text = &self.input[start..self.pos];
        Ok(Some(parse_atom(text)?))
    }
}

fn parse_atom(text: &str) -> Result<Value> {
    if text == "nil" {
        return Ok(Value::Nil);
    }
    let numeric = {
        let digits = text.strip_prefix('-').unwrap_or(text);
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
    };
    if numeric {
        match text.parse::<i64>() {
            Ok(n) => Ok(Value::Int(n)),
            Err(_) => ProtocolSnafu {
                detail: format!("integer out of range: {text}"),
            }
            .fail(),
        }
    } else {
        Ok(Value::Sym(text.to_owned()))
    }
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {
                return ProtocolSnafu {
                    detail: "dangling escape in string",
                }
                .fail()
            }
        }
    }
    Ok(out)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Sym(s) => write!(f, "{s}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        _ => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Value {
        read_one(input).unwrap().unwrap().0
    }

    #[test]
    fn atoms() {
        assert_eq!(parse("hello "), Value::sym("hello"));
        assert_eq!(parse("42 "), Value::Int(42));
        assert_eq!(parse("-7 "), Value::Int(-7));
        assert_eq!(parse("nil "), Value::Nil);
        assert_eq!(parse("\"hi there\""), Value::str("hi there"));
    }

    #[test]
    fn nested_lists() {
        assert_eq!(
            parse("(insert \"buf\" (1 2) nil)"),
            Value::List(vec![
                Value::sym("insert"),
                Value::str("buf"),
                Value::List(vec![Value::Int(1), Value::Int(2)]),
                Value::Nil,
            ])
        );
        assert_eq!(parse("()"), Value::Nil);
    }

    #[test]
    fn dotted_pairs_flatten() {
        assert_eq!(
            parse("(3 . \"abc\")"),
            Value::List(vec![Value::Int(3), Value::str("abc")])
        );
        assert_eq!(
            parse("(a b . c)"),
            Value::List(vec![Value::sym("a"), Value::sym("b"), Value::sym("c")])
        );
    }

    #[test]
    fn string_escapes_roundtrip() {
        let original = Value::str("a \"quoted\" line\nwith \\ backslash");
        let printed = original.to_string();
        assert_eq!(parse(&printed), original);
    }

    #[test]
    fn incomplete_forms_wait_for_more() {
        assert!(read_one("").unwrap().is_none());
        assert!(read_one("   ").unwrap().is_none());
        assert!(read_one("(hello \"wor").unwrap().is_none());
        assert!(read_one("(a (b c)").unwrap().is_none());
        // a bare atom could still be growing
        assert!(read_one("hel").unwrap().is_none());
    }

    #[test]
    fn consumed_length_leaves_next_frame() {
        let input = "(a 1) (b 2)";
        let (first, used) = read_one(input).unwrap().unwrap();
        assert_eq!(
            first,
            Value::List(vec![Value::sym("a"), Value::Int(1)])
        );
        let (second, _) = read_one(&input[used..]).unwrap().unwrap();
        assert_eq!(
            second,
            Value::List(vec![Value::sym("b"), Value::Int(2)])
        );
    }

    #[test]
    fn invalid_input_is_an_error() {
        assert!(read_one(")").is_err());
        assert!(read_one("(a . b c)").is_err());
        assert!(read_one("99999999999999999999 ").is_err());
    }

    #[test]
    fn booleans() {
        assert_eq!(Value::bool(true).to_string(), "t");
        assert_eq!(Value::bool(false).to_string(), "nil");
        assert!(parse("t ").is_truthy());
        assert!(!parse("nil ").is_truthy());
    }
}
