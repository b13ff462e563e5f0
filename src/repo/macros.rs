//! `#define` collection and numeric evaluation of C macro expressions.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::compiled;

static DEFINE_LINE: LazyLock<Regex> =
    LazyLock::new(|| compiled(r"^\s*#\s*define\s+(\w+)\s+(.+)$"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Arithmetic mode of the evaluator
pub enum EvalMode {
    /// Macro evaluation: division truncates, results are integers
    Int,
    /// Field-default evaluation: true division, float results
    Float,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let c = bytes[pos] as char;
        match c {
            ' ' | '\t' => pos += 1,
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                pos += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                pos += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                pos += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                pos += 1;
            }
            '~' => {
                tokens.push(Token::Tilde);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '<' | '>' => {
                if pos + 1 >= bytes.len() || bytes[pos + 1] != bytes[pos] {
                    return None;
                }
                tokens.push(if c == '<' { Token::Shl } else { Token::Shr });
                pos += 2;
            }
            '0'..='9' | '.' => {
                let start = pos;
                if c == '0' && bytes.get(pos + 1).map(|b| *b | 0x20) == Some(b'x') {
                    pos += 2;
                    while pos < bytes.len() && (bytes[pos] as char).is_ascii_hexdigit() {
                        pos += 1;
                    }
                    let digits = &expr[start + 2..pos];
                    let value = u64::from_str_radix(digits, 16).ok()?;
                    tokens.push(Token::Number(value as f64));
                } else {
                    while pos < bytes.len()
                        && ((bytes[pos] as char).is_ascii_digit() || bytes[pos] == b'.')
                    {
                        pos += 1;
                    }
                    tokens.push(Token::Number(expr[start..pos].parse().ok()?));
                }
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = pos;
                while pos < bytes.len()
                    && ((bytes[pos] as char).is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                tokens.push(Token::Ident(expr[start..pos].to_string()));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    mode: EvalMode,
    resolver: &'a MacroResolver,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn binary_precedence(token: &Token) -> Option<u8> {
        Some(match token {
            Token::Pipe => 1,
            Token::Caret => 2,
            Token::Amp => 3,
            Token::Shl | Token::Shr => 4,
            Token::Plus | Token::Minus => 5,
            Token::Star | Token::Slash | Token::Percent => 6,
            _ => return None,
        })
    }

    fn primary(&mut self) -> Option<f64> {
        let token = self.peek()?.clone();
        self.pos += 1;
        match token {
            Token::Number(value) => Some(value),
            Token::Ident(name) => self.resolver.evaluate(&name).map(|v| v as f64),
            Token::Minus => Some(-self.primary()?),
            Token::Plus => self.primary(),
            Token::Tilde => {
                let operand = self.primary()?;
                Some((!(operand as i64) & 0xFFFF_FFFF) as f64)
            }
            Token::LParen => {
                let value = self.expression(0)?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Some(value)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn expression(&mut self, min_precedence: u8) -> Option<f64> {
        let mut left = self.primary()?;
        while let Some(token) = self.peek() {
            let Some(precedence) = Self::binary_precedence(token) else {
                break;
            };
            if precedence < min_precedence {
                break;
            }
            let token = token.clone();
            self.pos += 1;
            let right = self.expression(precedence + 1)?;
            left = self.apply(&token, left, right)?;
        }
        Some(left)
    }

    fn apply(&self, token: &Token, left: f64, right: f64) -> Option<f64> {
        Some(match token {
            Token::Plus => left + right,
            Token::Minus => left - right,
            Token::Star => left * right,
            Token::Slash => {
                if right == 0.0 {
                    return None;
                }
                match self.mode {
                    EvalMode::Int => (left / right).trunc(),
                    EvalMode::Float => left / right,
                }
            }
            Token::Percent => match self.mode {
                EvalMode::Int => return None,
                EvalMode::Float => {
                    if right == 0.0 {
                        return None;
                    }
                    left % right
                }
            },
            Token::Pipe => ((left as i64) | (right as i64)) as f64,
            Token::Amp => ((left as i64) & (right as i64)) as f64,
            Token::Caret => ((left as i64) ^ (right as i64)) as f64,
            Token::Shl | Token::Shr => {
                let shift = right as i64;
                if !(0..=63).contains(&shift) {
                    return None;
                }
                let value = left as i64;
                (if matches!(token, Token::Shl) {
                    value << shift
                } else {
                    value >> shift
                }) as f64
            }
            _ => return None,
        })
    }
}

#[derive(Debug)]
/// The first `#define NAME EXPR` per name across the repo sources, with
/// command-line overrides layered on top and evaluation memoized
pub struct MacroResolver {
    definitions: HashMap<String, String>,
    cache: RefCell<HashMap<String, Option<i64>>>,
    in_progress: RefCell<HashSet<String>>,
}

impl MacroResolver {
    /// Collect definitions from source texts; the first definition of a
    /// name wins, and overrides replace collected definitions outright
    pub fn new<'a>(
        sources: impl IntoIterator<Item = &'a str>,
        overrides: &[(String, String)],
    ) -> Self {
        let mut definitions = HashMap::new();
        for text in sources {
            for line in text.lines() {
                if let Some(caps) = DEFINE_LINE.captures(line) {
                    if let (Some(name), Some(expr)) = (caps.get(1), caps.get(2)) {
                        definitions
                            .entry(name.as_str().to_string())
                            .or_insert_with(|| expr.as_str().trim().to_string());
                    }
                }
            }
        }
        for (name, expr) in overrides {
            definitions.insert(name.clone(), expr.clone());
        }
        Self {
            definitions,
            cache: RefCell::new(HashMap::new()),
            in_progress: RefCell::new(HashSet::new()),
        }
    }

    /// Evaluate a macro to an integer. Returns `None` for undefined names,
    /// non-numeric expansions, and definition cycles.
    pub fn evaluate(&self, name: &str) -> Option<i64> {
        if let Some(cached) = self.cache.borrow().get(name) {
            return *cached;
        }
        let expr = self.definitions.get(name)?.clone();
        if !self.in_progress.borrow_mut().insert(name.to_string()) {
            return None;
        }
        let value = self
            .eval_with_mode(&expr, EvalMode::Int)
            .map(|v| v as i64);
        self.in_progress.borrow_mut().remove(name);
        self.cache.borrow_mut().insert(name.to_string(), value);
        value
    }

    /// Evaluate a free-standing numeric expression, resolving macro names
    /// through this resolver
    pub fn eval_numeric(&self, expr: &str) -> Option<f64> {
        self.eval_with_mode(expr, EvalMode::Float)
    }

    fn eval_with_mode(&self, expr: &str, mode: EvalMode) -> Option<f64> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return None;
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            mode,
            resolver: self,
        };
        let value = parser.expression(0)?;
        if parser.pos != tokens.len() {
            return None;
        }
        Some(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn resolver(text: &str) -> MacroResolver {
        MacroResolver::new([text], &[])
    }

    #[test]
    fn test_simple_defines() {
        let r = resolver("#define DOOR_START_OPEN 1\n#define DOOR_REVERSE 2\n");
        assert_eq!(r.evaluate("DOOR_START_OPEN"), Some(1));
        assert_eq!(r.evaluate("DOOR_REVERSE"), Some(2));
        assert_eq!(r.evaluate("UNDEFINED"), None);
    }

    #[test]
    fn test_expression_operators() {
        let r = resolver(
            "#define A (1 << 4)\n#define B (A | 0x20)\n#define C (~A & 0xff)\n#define D (7 / 2)\n",
        );
        assert_eq!(r.evaluate("A"), Some(16));
        assert_eq!(r.evaluate("B"), Some(48));
        assert_eq!(r.evaluate("C"), Some(0xEF));
        assert_eq!(r.evaluate("D"), Some(3));
    }

    #[test]
    fn test_first_definition_wins_and_overrides_replace() {
        let r = MacroResolver::new(
            ["#define FLAG 1\n#define FLAG 2\n"],
            &[("GATE".to_string(), "0".to_string())],
        );
        assert_eq!(r.evaluate("FLAG"), Some(1));
        assert_eq!(r.evaluate("GATE"), Some(0));
    }

    #[test]
    fn test_cycles_and_garbage_fail_quietly() {
        let r = resolver("#define A B\n#define B A\n#define S \"text\"\n");
        assert_eq!(r.evaluate("A"), None);
        assert_eq!(r.evaluate("S"), None);
    }

    #[test]
    fn test_numeric_expression_mode() {
        let r = resolver("#define SPEED 100\n");
        assert_eq!(r.eval_numeric("SPEED * 2"), Some(200.0));
        assert_eq!(r.eval_numeric("7 / 2"), Some(3.5));
        assert_eq!(r.eval_numeric("1.5"), Some(1.5));
        assert_eq!(r.eval_numeric("banana phone"), None);
    }
}
