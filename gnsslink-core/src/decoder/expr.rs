//! Restricted arithmetic for derived fields.
//!
//! Grammar:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := ('+' | '-') factor | number | name | '(' expr ')'
//! ```
//!
//! Any character outside digits, `.`, names, operators, parentheses and
//! whitespace rejects the whole expression.

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(text.parse().ok()?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    lookup: &'a dyn Fn(&str) -> Option<f64>,
}

/// Nesting limit for parentheses and unary signs.
const MAX_DEPTH: usize = 64;

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Some(value),
            }
        }
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return None;
                    }
                    value /= divisor;
                }
                _ => return Some(value),
            }
        }
    }

    fn factor(&mut self) -> Option<f64> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = self.atom();
        self.depth -= 1;
        value
    }

    fn atom(&mut self) -> Option<f64> {
        match self.bump()?.clone() {
            Token::Minus => Some(-self.factor()?),
            Token::Plus => self.factor(),
            Token::Number(n) => Some(n),
            Token::Name(name) => (self.lookup)(&name),
            Token::LParen => {
                let value = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Some(value),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Evaluate an expression, resolving names through `lookup`.
///
/// Returns `None` for rejected characters, unknown names, malformed
/// syntax, division by zero or a non-finite result.
pub fn evaluate(expr: &str, lookup: &dyn Fn(&str) -> Option<f64>) -> Option<f64> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return None;
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        lookup,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() || !value.is_finite() {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(name: &str) -> Option<f64> {
        match name {
            "hgt" => Some(100.0),
            "undulation" => Some(-20.5),
            "scale" => Some(2.0),
            _ => None,
        }
    }

    #[test]
    fn test_precedence() {
        assert_eq!(evaluate("1 + 2 * 3", &vars), Some(7.0));
        assert_eq!(evaluate("(1 + 2) * 3", &vars), Some(9.0));
        assert_eq!(evaluate("10 - 4 - 3", &vars), Some(3.0));
        assert_eq!(evaluate("8 / 2 / 2", &vars), Some(2.0));
    }

    #[test]
    fn test_nesting_limit() {
        let shallow = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(evaluate(&shallow, &vars), Some(1.0));

        let deep = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(evaluate(&deep, &vars), None);
        assert_eq!(evaluate(&format!("{}1", "-".repeat(200_000)), &vars), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(evaluate("hgt + undulation", &vars), Some(79.5));
        assert_eq!(evaluate("-hgt * scale", &vars), Some(-200.0));
    }

    #[test]
    fn test_rejections() {
        assert_eq!(evaluate("hgt ^ 2", &vars), None);
        assert_eq!(evaluate("missing + 1", &vars), None);
        assert_eq!(evaluate("1 / 0", &vars), None);
        assert_eq!(evaluate("(1 + 2", &vars), None);
        assert_eq!(evaluate("1 2", &vars), None);
        assert_eq!(evaluate("", &vars), None);
        assert_eq!(evaluate("1..2", &vars), None);
    }
}
