//! Arithmetic formula evaluation for constraint terms.
//!
//! A constraint formula is a small arithmetic expression over the names of
//! its operand parameters, e.g. `"dm_s / dm_d"` or `"0.5 * (a + b)"`.
//! Parsing resolves each name to an index into the operand list once, so
//! evaluation during minimisation is a straight walk with no lookups.

use std::fmt;

/// A parsed, evaluable constraint formula.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaExpr {
    root: Node,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(f64),
    Operand(usize),
    Neg(Box<Node>),
    Add(Box<Node>, Box<Node>),
    Sub(Box<Node>, Box<Node>),
    Mul(Box<Node>, Box<Node>),
    Div(Box<Node>, Box<Node>),
}

/// Why a formula failed to parse. Constraint resolution treats any parse
/// failure as a soft error and drops the constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    /// A name in the formula is not in the operand list.
    UnknownOperand(String),
    /// The formula text is not a valid expression.
    Syntax(String),
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaError::UnknownOperand(name) => write!(f, "unknown operand `{name}`"),
            FormulaError::Syntax(msg) => write!(f, "syntax error: {msg}"),
        }
    }
}

impl FormulaExpr {
    /// Parses `source` against the ordered operand name list.
    pub fn parse(source: &str, operands: &[String]) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            operands,
        };
        let root = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(FormulaError::Syntax(format!(
                "trailing input after position {}",
                parser.pos
            )));
        }
        Ok(Self { root })
    }

    /// Evaluates the formula against operand values given in the same
    /// order as the operand list passed to [`FormulaExpr::parse`].
    pub fn eval(&self, values: &[f64]) -> f64 {
        eval_node(&self.root, values)
    }
}

fn eval_node(node: &Node, values: &[f64]) -> f64 {
    match node {
        Node::Literal(x) => *x,
        Node::Operand(slot) => values[*slot],
        Node::Neg(inner) => -eval_node(inner, values),
        Node::Add(a, b) => eval_node(a, values) + eval_node(b, values),
        Node::Sub(a, b) => eval_node(a, values) - eval_node(b, values),
        Node::Mul(a, b) => eval_node(a, values) * eval_node(b, values),
        Node::Div(a, b) => eval_node(a, values) / eval_node(b, values),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' {
                        text.push(d);
                        chars.next();
                        // Exponent sign only immediately after e/E.
                        if (d == 'e' || d == 'E')
                            && matches!(chars.peek(), Some('+') | Some('-'))
                        {
                            text.push(chars.next().unwrap());
                        }
                    } else {
                        break;
                    }
                }
                let value: f64 = text
                    .parse()
                    .map_err(|_| FormulaError::Syntax(format!("bad number `{text}`")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            other => {
                return Err(FormulaError::Syntax(format!("unexpected character `{other}`")));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    operands: &'a [String],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<Node, FormulaError> {
        let mut node = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    node = Node::Add(Box::new(node), Box::new(self.term()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    node = Node::Sub(Box::new(node), Box::new(self.term()?));
                }
                _ => return Ok(node),
            }
        }
    }

    fn term(&mut self) -> Result<Node, FormulaError> {
        let mut node = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    node = Node::Mul(Box::new(node), Box::new(self.factor()?));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    node = Node::Div(Box::new(node), Box::new(self.factor()?));
                }
                _ => return Ok(node),
            }
        }
    }

    fn factor(&mut self) -> Result<Node, FormulaError> {
        match self.peek().cloned() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.factor()?)))
            }
            Some(Token::Number(value)) => {
                self.pos += 1;
                Ok(Node::Literal(value))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                let slot = self
                    .operands
                    .iter()
                    .position(|op| *op == name)
                    .ok_or(FormulaError::UnknownOperand(name))?;
                Ok(Node::Operand(slot))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(FormulaError::Syntax("unclosed parenthesis".to_string())),
                }
            }
            other => Err(FormulaError::Syntax(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_operand_is_identity() {
        let expr = FormulaExpr::parse("dm_s", &ops(&["dm_s"])).unwrap();
        assert_eq!(expr.eval(&[17.7]), 17.7);
    }

    #[test]
    fn precedence_and_parentheses() {
        let expr = FormulaExpr::parse("a + b * 2", &ops(&["a", "b"])).unwrap();
        assert_eq!(expr.eval(&[1.0, 3.0]), 7.0);
        let expr = FormulaExpr::parse("(a + b) * 2", &ops(&["a", "b"])).unwrap();
        assert_eq!(expr.eval(&[1.0, 3.0]), 8.0);
    }

    #[test]
    fn ratio_with_unary_minus() {
        let expr = FormulaExpr::parse("-a / b", &ops(&["a", "b"])).unwrap();
        assert_eq!(expr.eval(&[6.0, 2.0]), -3.0);
    }

    #[test]
    fn scientific_literals() {
        let expr = FormulaExpr::parse("a * 1e-3", &ops(&["a"])).unwrap();
        assert!((expr.eval(&[2.0]) - 2e-3).abs() < 1e-15);
    }

    #[test]
    fn unknown_operand_is_rejected() {
        let err = FormulaExpr::parse("a + c", &ops(&["a", "b"])).unwrap_err();
        assert_eq!(err, FormulaError::UnknownOperand("c".to_string()));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(FormulaExpr::parse("a b", &ops(&["a", "b"])).is_err());
        assert!(FormulaExpr::parse("(a", &ops(&["a"])).is_err());
    }
}
