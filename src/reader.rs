//! Reader: source text to values.
//!
//! Reading happens in two stages. A nom-based parser turns one
//! expression of input text into a host-side [`Sexpr`] tree, then the
//! tree is lowered into pool cells with the partial structures rooted
//! against collection. Macro expansion runs on every list as it is
//! lowered, innermost lists first.
//!
//! Syntax errors do not abort: the reader leaves an `invalid-syntax` or
//! `mismatched-parentheses` error value on the operand stack, exactly
//! like any other result.

use nom::bytes::complete::take_while1;
use nom::error::{Error as NomError, ErrorKind};
use nom::IResult;

use crate::interp::{Interp, ListBuilder};
use crate::platform::SCRATCH_BUFFER_SIZE;
use crate::value::{ErrorCode, TypeTag, ValueRef};

/// Nesting limit for the parser, against stack overflow on hostile
/// input.
const MAX_READ_DEPTH: usize = 50;

/// Host-side expression tree, the intermediate between text and cells.
#[derive(Debug, Clone, PartialEq)]
enum Sexpr {
    Nil,
    Integer(i32),
    Symbol(String),
    Str(String),
    List {
        elements: Vec<Sexpr>,
        tail: Option<Box<Sexpr>>,
    },
    /// A `'` or `` ` `` glued to the expression after it, lowered as
    /// `(quote-sym . expr)`.
    Quoted { kind: char, expr: Box<Sexpr> },
}

/// Skip whitespace and `;`-to-end-of-line comments.
fn atmosphere(input: &str) -> &str {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start_matches([' ', '\t', '\r', '\n']);
        if let Some(comment) = trimmed.strip_prefix(';') {
            match comment.find(['\r', '\n']) {
                Some(end) => rest = &comment[end..],
                None => return "",
            }
        } else {
            return trimmed;
        }
    }
}

fn is_token_char(c: char) -> bool {
    !matches!(c, ' ' | '\t' | '\r' | '\n' | '(' | ')' | '[' | ']' | ';' | '"')
}

fn fail(input: &str, kind: ErrorKind) -> nom::Err<NomError<&str>> {
    nom::Err::Failure(NomError::new(input, kind))
}

/// Classify a maximal token: decimal or hex integer, nil, or symbol.
fn classify_token(token: &str) -> Sexpr {
    if token == "nil" {
        return Sexpr::Nil;
    }
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) if !rest.is_empty() => (true, rest),
        _ => (false, token),
    };
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        let mut value: i32 = 0;
        for b in digits.bytes() {
            value = value.wrapping_mul(10).wrapping_add(i32::from(b - b'0'));
        }
        if negative {
            value = value.wrapping_neg();
        }
        return Sexpr::Integer(value);
    }
    if let Some(hex) = digits.strip_prefix("0x") {
        let lowercase_hex = !hex.is_empty()
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if lowercase_hex {
            let mut value: u32 = 0;
            for b in hex.bytes() {
                let digit = match b {
                    b'0'..=b'9' => u32::from(b - b'0'),
                    _ => u32::from(b - b'a') + 10,
                };
                value = (value << 4) | digit;
            }
            let mut value = value as i32;
            if negative {
                value = value.wrapping_neg();
            }
            return Sexpr::Integer(value);
        }
    }
    Sexpr::Symbol(token.to_string())
}

fn parse_string(input: &str) -> IResult<&str, Sexpr> {
    match input.find('"') {
        Some(end) => {
            if end + 1 >= SCRATCH_BUFFER_SIZE {
                // Would not fit in a scratch buffer.
                Err(fail(input, ErrorKind::Verify))
            } else {
                Ok((&input[end + 1..], Sexpr::Str(input[..end].to_string())))
            }
        }
        None => Err(fail(input, ErrorKind::Verify)),
    }
}

fn parse_list(input: &str, depth: usize) -> IResult<&str, Sexpr> {
    let mut rest = input;
    let mut elements = Vec::new();

    loop {
        rest = atmosphere(rest);
        let mut chars = rest.chars();
        match chars.next() {
            None => return Err(fail(rest, ErrorKind::Char)),
            Some(')') | Some(']') => {
                return Ok((
                    chars.as_str(),
                    Sexpr::List {
                        elements,
                        tail: None,
                    },
                ));
            }
            Some('.') => {
                // Dotted tail: exactly one value, then the closer.
                if elements.is_empty() {
                    return Err(fail(rest, ErrorKind::Char));
                }
                let (after_tail, tail) = parse_expr(chars.as_str(), depth + 1)?;
                let after_tail = atmosphere(after_tail);
                let mut closer = after_tail.chars();
                match closer.next() {
                    Some(')') | Some(']') => {
                        return Ok((
                            closer.as_str(),
                            Sexpr::List {
                                elements,
                                tail: Some(Box::new(tail)),
                            },
                        ));
                    }
                    _ => return Err(fail(after_tail, ErrorKind::Char)),
                }
            }
            Some(_) => {
                let (after, element) = parse_expr(rest, depth + 1)?;
                elements.push(element);
                rest = after;
            }
        }
    }
}

/// Parse one expression. The input must already be past leading
/// atmosphere and non-empty.
fn parse_expr(input: &str, depth: usize) -> IResult<&str, Sexpr> {
    if depth >= MAX_READ_DEPTH {
        return Err(fail(input, ErrorKind::TooLarge));
    }
    let input = atmosphere(input);
    let mut chars = input.chars();
    match chars.next() {
        None => Err(fail(input, ErrorKind::Char)),
        Some('(') | Some('[') => parse_list(chars.as_str(), depth),
        Some(')') | Some(']') => Err(fail(input, ErrorKind::Char)),
        Some('"') => parse_string(chars.as_str()),
        Some(q @ ('\'' | '`')) => {
            // Quote glues to the following expression; a dangling quote
            // pairs with nil.
            let rest = atmosphere(chars.as_str());
            if rest.is_empty() {
                Ok((
                    rest,
                    Sexpr::Quoted {
                        kind: q,
                        expr: Box::new(Sexpr::Nil),
                    },
                ))
            } else {
                let (after, expr) = parse_expr(rest, depth + 1)?;
                Ok((
                    after,
                    Sexpr::Quoted {
                        kind: q,
                        expr: Box::new(expr),
                    },
                ))
            }
        }
        Some(c @ (',' | '@')) => Ok((chars.as_str(), Sexpr::Symbol(c.to_string()))),
        Some(_) => {
            let (rest, token) = take_while1(is_token_char)(input)?;
            Ok((rest, classify_token(token)))
        }
    }
}

impl Interp {
    /// Read one expression from `code`, leaving the result on the
    /// operand stack, and return the number of input bytes consumed.
    /// End of input leaves nil; malformed input leaves an error value.
    pub fn read(&mut self, code: &str) -> usize {
        let stripped = atmosphere(code);
        if stripped.is_empty() {
            self.push_op(self.nil);
            return code.len();
        }

        match parse_expr(stripped, 0) {
            Ok((rest, sexpr)) => {
                let consumed = code.len() - rest.len();
                let value = self.lower_sexpr(&sexpr);
                self.push_op(value);
                consumed
            }
            Err(e) => {
                let kind = match e {
                    nom::Err::Error(inner) | nom::Err::Failure(inner) => inner.code,
                    nom::Err::Incomplete(_) => ErrorKind::Eof,
                };
                let code_kind = match kind {
                    ErrorKind::Char => ErrorCode::MismatchedParens,
                    _ => ErrorCode::InvalidSyntax,
                };
                let err = self.make_error(code_kind, self.nil);
                self.push_op(err);
                code.len()
            }
        }
    }

    fn lower_sexpr(&mut self, sexpr: &Sexpr) -> ValueRef {
        match sexpr {
            Sexpr::Nil => self.nil,
            Sexpr::Integer(n) => self.make_integer(*n),
            Sexpr::Symbol(name) => self.make_symbol(name),
            Sexpr::Str(text) => self.make_string(text),
            Sexpr::Quoted { kind, expr } => {
                let sym = self.make_symbol(&kind.to_string());
                self.push_op(sym);
                let inner = self.lower_sexpr(expr);
                let pair = self.make_cons(sym, inner);
                self.pop_op();
                pair
            }
            Sexpr::List { elements, tail } => {
                let mut builder = ListBuilder::new(self);
                for element in elements {
                    let v = self.lower_sexpr(element);
                    builder.push_back(self, v);
                }
                let list = builder.result(self);

                if let Some(t) = tail {
                    self.push_op(list);
                    let tail_value = self.lower_sexpr(t);
                    let mut last = list;
                    while self.type_of(self.cdr(last)) == TypeTag::Cons {
                        last = self.cdr(last);
                    }
                    self.set_cdr(last, tail_value);
                    self.pop_op();
                }

                // Expansion runs on each list as it is read, innermost
                // lists first.
                self.push_op(list);
                self.macroexpand();
                self.pop_op()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StdPlatform;

    fn test_interp() -> Interp {
        Interp::new(Box::new(StdPlatform))
    }

    /// Read one expression and format the resulting value.
    fn read_to_text(interp: &mut Interp, input: &str) -> String {
        interp.read(input);
        let v = interp.pop_op();
        interp.format(v)
    }

    #[test]
    fn test_read_atoms() {
        let mut interp = test_interp();
        let cases = [
            ("42", "42"),
            ("-17", "-17"),
            ("0", "0"),
            ("0xff", "255"),
            ("0x10", "16"),
            ("-0x10", "-16"),
            ("nil", "'()"),
            ("walrus", "walrus"),
            ("-", "-"),
            ("-abc", "-abc"),
            ("a.b", "a.b"),
            ("\"hi there\"", "\"hi there\""),
        ];
        for (input, expected) in cases {
            assert_eq!(read_to_text(&mut interp, input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_read_lists() {
        let mut interp = test_interp();
        let cases = [
            ("(1 2 3)", "'(1 2 3)"),
            ("[1 2 3]", "'(1 2 3)"),
            ("()", "'()"),
            ("(a (b c) d)", "'(a (b c) d)"),
            ("(1 . 2)", "'(1 . 2)"),
            ("(1 2 . 3)", "'(1 2 . 3)"),
            ("( 1   2\t\n3 )", "'(1 2 3)"),
        ];
        for (input, expected) in cases {
            assert_eq!(read_to_text(&mut interp, input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_read_comments_and_spacing() {
        let mut interp = test_interp();
        assert_eq!(
            read_to_text(&mut interp, "; leading comment\n  (1 2) ; trailing"),
            "'(1 2)"
        );
        // Comment-only input reads as nil (end of input).
        assert_eq!(read_to_text(&mut interp, "; nothing here"), "'()");
        assert_eq!(read_to_text(&mut interp, "   \t\r\n "), "'()");
    }

    #[test]
    fn test_read_quote_glues_to_next_expression() {
        let mut interp = test_interp();
        assert_eq!(read_to_text(&mut interp, "'x"), "'(' . x)");
        assert_eq!(read_to_text(&mut interp, "'(1 2)"), "'(' 1 2)");
        assert_eq!(read_to_text(&mut interp, "`(1 ,a)"), "'(` 1 , a)");
        // Quotes glue inside lists as well.
        assert_eq!(read_to_text(&mut interp, "(f '(1 2))"), "'(f (' 1 2))");
    }

    #[test]
    fn test_read_errors() {
        let mut interp = test_interp();
        let cases = [
            ("(1 2", "mismatched-parentheses"),
            (")", "mismatched-parentheses"),
            ("(. 2)", "mismatched-parentheses"),
            ("(1 . 2 3)", "mismatched-parentheses"),
            ("(1 . )", "mismatched-parentheses"),
            ("\"unterminated", "invalid-syntax"),
        ];
        for (input, expected) in cases {
            interp.read(input);
            let v = interp.pop_op();
            assert!(interp.is_error(v), "expected error for {input:?}");
            let code = interp.error_code(v).unwrap();
            assert_eq!(code.as_str(), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_read_depth_limit() {
        let mut interp = test_interp();
        let deep = format!("{}1{}", "(".repeat(80), ")".repeat(80));
        interp.read(&deep);
        let v = interp.pop_op();
        assert!(interp.is_error(v));
        assert_eq!(
            interp.error_code(v).unwrap().as_str(),
            "invalid-syntax"
        );
    }

    #[test]
    fn test_read_consumes_one_expression_at_a_time() {
        let mut interp = test_interp();
        let input = " (1 2) (3 4) ";
        let consumed = interp.read(input);
        assert_eq!(interp.format(interp.get_op0()), "'(1 2)");
        interp.pop_op();
        let consumed2 = interp.read(&input[consumed..]);
        assert_eq!(interp.format(interp.get_op0()), "'(3 4)");
        interp.pop_op();
        interp.read(&input[consumed + consumed2..]);
        let last = interp.pop_op();
        assert_eq!(last, interp.nil());
    }

    #[test]
    fn test_read_format_round_trip() {
        let mut interp = test_interp();
        // read(format(v)) reproduces v structurally for integers,
        // symbols, nil, and proper lists (modulo the quote the printer
        // adds at depth zero).
        for source in ["7", "-13", "pelican", "(1 2 3)", "(a (b 2) ())"] {
            interp.read(source);
            let first = interp.pop_op();
            interp.gc_protect(first);
            let printed = interp.format(first);
            interp.read(&printed);
            let second = interp.pop_op();
            interp.gc_protect(second);

            // Strip the printer's depth-zero quote wrapper.
            let second = if interp.symbol_name(interp.car(second)) == "'" {
                interp.cdr(second)
            } else {
                second
            };

            assert_eq!(
                interp.format(first),
                interp.format(second),
                "round trip failed for {source:?}"
            );
            interp.gc_unprotect();
            interp.gc_unprotect();
        }
    }
}
