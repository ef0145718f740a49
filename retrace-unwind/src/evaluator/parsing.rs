//! Parsing of [expressions](super::Expr) and [rules](super::Rule).
//!
//! Parsing happens in two stages: [`nom`] lexes the input into a flat token
//! stream, and a small operand stack folds the tokens into expression trees.
//! Keeping the stages apart gives malformed programs a precise rejection
//! reason (an operator with a missing operand, operands left dangling, a
//! rule without a right-hand side) instead of a generic parser error.

use std::error::Error;
use std::fmt;

use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0, one_of};
use nom::combinator::{all_consuming, map, map_opt, verify};
use nom::error::ParseError;
use nom::multi::many0;
use nom::sequence::{preceded, terminated};
use nom::{Finish, IResult};

use super::*;

/// The error kind for [`ParseExprError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseExprErrorKind {
    /// An operator was encountered with too few operands on the stack.
    MissingOperand,

    /// Operands were left on the stack with no operator to consume them.
    DanglingOperands,

    /// A rule did not reduce to exactly one rule with one expression.
    MalformedRule,

    /// A rule was expected, but the input does not start with `ident:`.
    ExpectedRule,

    /// The input could not be tokenized.
    Lex(nom::error::ErrorKind),
}

impl fmt::Display for ParseExprErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingOperand => write!(f, "an operator is missing an operand"),
            Self::DanglingOperands => {
                write!(f, "operands are left over after applying all operators")
            }
            Self::MalformedRule => {
                write!(f, "a rule must bind one identifier to one expression")
            }
            Self::ExpectedRule => write!(f, "expected an `identifier:` rule binding"),
            Self::Lex(kind) => write!(f, "unrecognized token ({})", kind.description()),
        }
    }
}

/// An error encountered while parsing expressions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseExprError {
    /// The kind of error.
    kind: ParseExprErrorKind,

    /// The input that caused the error.
    input: String,
}

fn parse_error(kind: ParseExprErrorKind, input: &str) -> ParseExprError {
    ParseExprError {
        kind,
        input: input.to_string(),
    }
}

impl<'a> ParseError<&'a str> for ParseExprError {
    fn from_error_kind(input: &'a str, kind: nom::error::ErrorKind) -> Self {
        parse_error(ParseExprErrorKind::Lex(kind), input)
    }

    fn append(_input: &'a str, _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "error encountered while trying to parse input {:?}: {}",
            self.input, self.kind
        )
    }
}

impl Error for ParseExprError {}

/// One lexical token of a rule program.
#[derive(Debug)]
enum Token<T> {
    /// The start of a rule: an identifier followed by a colon.
    Rule(Identifier),

    /// A literal, variable or constant operand.
    Operand(Expr<T>),

    /// A binary operator.
    Operator(BinOp),

    /// The dereference marker `^`.
    Deref,
}

fn is_constant_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Parses a [variable](super::Variable).
///
/// This accepts identifiers of the form `$[a-zA-Z][a-zA-Z0-9]*`.
fn variable(input: &str) -> IResult<&str, Variable, ParseExprError> {
    let body = verify(
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        |name: &str| name.starts_with(|c: char| c.is_ascii_alphabetic()),
    );

    map(preceded(char('$'), body), |name| {
        Variable(format!("${}", name))
    })(input)
}

/// Parses a [variable](super::Variable).
///
/// It will fail if there is any input remaining afterwards.
pub fn variable_complete(input: &str) -> Result<Variable, ParseExprError> {
    all_consuming(variable)(input).finish().map(|(_, v)| v)
}

/// Parses a [constant](super::Constant).
///
/// This accepts identifiers of the form `[a-zA-Z_.][a-zA-Z0-9_.]*`.
fn constant(input: &str) -> IResult<&str, Constant, ParseExprError> {
    let body = verify(take_while1(is_constant_char), |name: &str| {
        !name.starts_with(|c: char| c.is_ascii_digit())
    });

    map(body, |name: &str| Constant(name.to_string()))(input)
}

/// Parses a [constant](super::Constant).
///
/// It will fail if there is any input remaining afterwards.
pub fn constant_complete(input: &str) -> Result<Constant, ParseExprError> {
    all_consuming(constant)(input).finish().map(|(_, c)| c)
}

/// Parses a variable or constant.
fn identifier(input: &str) -> IResult<&str, Identifier, ParseExprError> {
    alt((
        map(variable, Identifier::Var),
        map(constant, Identifier::Const),
    ))(input)
}

/// Parses a literal.
///
/// This accepts signed and unsigned decimal numbers as well as
/// `0x`-prefixed hexadecimal ones.
fn literal<T: RegisterValue>(input: &str) -> IResult<&str, T, ParseExprError> {
    map_opt(
        take_while1(|c: char| !c.is_ascii_whitespace() && c != ':'),
        T::from_literal,
    )(input)
}

/// Parses a [binary operator](super::BinOp).
fn operator(input: &str) -> IResult<&str, BinOp, ParseExprError> {
    let (rest, symbol) = one_of("+-*/%@")(input)?;
    let op = match symbol {
        '+' => BinOp::Add,
        '-' => BinOp::Sub,
        '*' => BinOp::Mul,
        '/' => BinOp::Div,
        '%' => BinOp::Mod,
        _ => BinOp::Align,
    };

    Ok((rest, op))
}

/// Parses a single token.
///
/// A rule binding (`ident:`) is tried first since its identifier would
/// otherwise lex as a plain operand.
fn token<T: RegisterValue>(input: &str) -> IResult<&str, Token<T>, ParseExprError> {
    alt((
        map(terminated(identifier, char(':')), Token::Rule),
        map(literal, |value| Token::Operand(Expr::Value(value))),
        map(variable, |v| Token::Operand(Expr::Var(v))),
        map(constant, |c| Token::Operand(Expr::Const(c))),
        map(operator, Token::Operator),
        map(char('^'), |_| Token::Deref),
    ))(input)
}

/// Lexes an entire input into tokens, rejecting trailing garbage.
fn tokens<T: RegisterValue>(input: &str) -> Result<Vec<Token<T>>, ParseExprError> {
    let stream = terminated(many0(preceded(multispace0, token)), multispace0);
    all_consuming(stream)(input)
        .finish()
        .map(|(_, tokens)| tokens)
}

/// The operand stack that folds a token stream into expression trees.
struct OperandStack<T> {
    operands: Vec<Expr<T>>,
}

impl<T: RegisterValue> OperandStack<T> {
    fn new() -> Self {
        OperandStack {
            operands: Vec::new(),
        }
    }

    /// Pops one operand; an empty stack means an operator is missing input.
    fn pop(&mut self, input: &str) -> Result<Expr<T>, ParseExprError> {
        self.operands
            .pop()
            .ok_or_else(|| parse_error(ParseExprErrorKind::MissingOperand, input))
    }

    /// Folds one token into the stack.
    fn apply(&mut self, token: Token<T>, input: &str) -> Result<(), ParseExprError> {
        match token {
            Token::Operand(expr) => self.operands.push(expr),
            Token::Operator(op) => {
                let rhs = self.pop(input)?;
                let lhs = self.pop(input)?;
                self.operands.push(Expr::Op(Box::new(lhs), Box::new(rhs), op));
            }
            Token::Deref => {
                let address = self.pop(input)?;
                self.operands.push(Expr::Deref(Box::new(address)));
            }
            // Rule boundaries are split off by the callers before folding.
            Token::Rule(_) => {
                return Err(parse_error(ParseExprErrorKind::MalformedRule, input))
            }
        }

        Ok(())
    }

    /// Reduces the stack to the single expression a complete program leaves.
    fn into_single(mut self, input: &str) -> Result<Expr<T>, ParseExprError> {
        let expr = self.pop(input)?;
        if self.operands.is_empty() {
            Ok(expr)
        } else {
            Err(parse_error(ParseExprErrorKind::DanglingOperands, input))
        }
    }
}

/// Parses an [expression](super::Expr).
///
/// The whole input must reduce to exactly one expression.
///
/// # Example
/// ```rust
/// use retrace_unwind::evaluator::parsing::expr_complete;
/// use retrace_unwind::evaluator::BinOp::*;
/// use retrace_unwind::evaluator::Expr::*;
///
/// let expr = expr_complete::<u64>("1 2 +").unwrap();
/// assert_eq!(expr, Op(Box::new(Value(1)), Box::new(Value(2)), Add));
/// ```
pub fn expr_complete<T: RegisterValue>(input: &str) -> Result<Expr<T>, ParseExprError> {
    let mut stack = OperandStack::new();
    for token in tokens(input)? {
        stack.apply(token, input)?;
    }

    stack.into_single(input)
}

/// Parses a sequence of [rules](super::Rule), as it appears after the
/// covered address range in a CFI record.
///
/// Every expression is bound to the `ident:` marker preceding it; input
/// before the first marker or left over after the last expression is an
/// error.
pub fn rules_complete<T: RegisterValue>(input: &str) -> Result<Vec<Rule<T>>, ParseExprError> {
    let mut rules = Vec::new();
    let mut current: Option<(Identifier, OperandStack<T>)> = None;

    for token in tokens(input)? {
        match token {
            Token::Rule(ident) => {
                if let Some((prev, stack)) = current.take() {
                    rules.push(Rule(prev, stack.into_single(input)?));
                }
                current = Some((ident, OperandStack::new()));
            }
            other => match current {
                Some((_, ref mut stack)) => stack.apply(other, input)?,
                None => return Err(parse_error(ParseExprErrorKind::ExpectedRule, input)),
            },
        }
    }

    match current {
        Some((ident, stack)) => rules.push(Rule(ident, stack.into_single(input)?)),
        None => return Err(parse_error(ParseExprErrorKind::ExpectedRule, input)),
    }

    Ok(rules)
}

/// Parses a single [rule](super::Rule).
///
/// It will fail if the input contains anything but that one rule.
pub fn rule_complete<T: RegisterValue>(input: &str) -> Result<Rule<T>, ParseExprError> {
    let mut rules = rules_complete(input)?;
    let rule = rules.pop();

    match rule {
        Some(rule) if rules.is_empty() => Ok(rule),
        _ => Err(parse_error(ParseExprErrorKind::MalformedRule, input)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_simple() {
        use Expr::*;
        let parsed = expr_complete::<u64>("1 2 + 3 *").unwrap();
        let expected = Op(
            Box::new(Op(Box::new(Value(1u64)), Box::new(Value(2)), BinOp::Add)),
            Box::new(Value(3)),
            BinOp::Mul,
        );
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_expr_deref_and_identifiers() {
        use Expr::*;
        let parsed = expr_complete::<u64>("1 2 ^ +").unwrap();
        let expected = Op(
            Box::new(Value(1u64)),
            Box::new(Deref(Box::new(Value(2)))),
            BinOp::Add,
        );
        assert_eq!(parsed, expected);

        let parsed = expr_complete::<u64>("-3 $foo *").unwrap();
        let expected = Op(
            Box::new(Value((-3i64) as u64)),
            Box::new(Var(Variable(String::from("$foo")))),
            BinOp::Mul,
        );
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_expr_missing_operand() {
        let err = expr_complete::<u64>("3 +").unwrap_err();
        assert_eq!(err.kind, ParseExprErrorKind::MissingOperand);
    }

    #[test]
    fn test_expr_dangling_operands() {
        let err = expr_complete::<u64>("1 2").unwrap_err();
        assert_eq!(err.kind, ParseExprErrorKind::DanglingOperands);
    }

    #[test]
    fn test_variable_rejects_leading_digit() {
        assert!(variable_complete("$eax").is_ok());
        assert!(variable_complete("$0ax").is_err());
        assert!(variable_complete("eax").is_err());
    }

    #[test]
    fn test_rule() {
        use Expr::*;
        let Rule(ident, expr) = rule_complete::<u32>(".cfa: $esp 8 +").unwrap();
        assert_eq!(ident, Identifier::Const(Constant::cfa()));
        assert_eq!(
            expr,
            Op(
                Box::new(Var(Variable("$esp".to_string()))),
                Box::new(Value(8)),
                BinOp::Add
            )
        );
    }

    #[test]
    fn test_rule_rejects_multiple() {
        assert!(rule_complete::<u32>(".cfa: $esp 8 + .ra: $eip").is_err());
    }

    #[test]
    fn test_rules_split_at_next_binding() {
        let input = ".cfa: $ebp 8 + $eip: .cfa 4 - ^ $ebp: .cfa 8 - ^";
        let rules = rules_complete::<u32>(input).unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].0, Identifier::Const(Constant::cfa()));
        assert_eq!(rules[1].0, Identifier::Var(Variable("$eip".to_string())));
        assert_eq!(rules[2].0, Identifier::Var(Variable("$ebp".to_string())));
    }

    #[test]
    fn test_rules_bare_register_names() {
        let input = ".cfa: sp 16 + .ra: .cfa 8 - ^ x29: .cfa 16 - ^";
        let rules = rules_complete::<u64>(input).unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[1].0, Identifier::Const(Constant::ra()));
        assert_eq!(rules[2].0, Identifier::Const(Constant("x29".to_string())));
    }

    #[test]
    fn test_rules_hex_literal() {
        let rules = rules_complete::<u64>(".cfa: 0x7ffe0000 8 +").unwrap();
        assert_eq!(
            rules[0].1,
            Expr::Op(
                Box::new(Expr::Value(0x7ffe_0000)),
                Box::new(Expr::Value(8)),
                BinOp::Add
            )
        );
    }

    #[test]
    fn test_rules_without_binding() {
        let err = rules_complete::<u64>("1 2 +").unwrap_err();
        assert_eq!(err.kind, ParseExprErrorKind::ExpectedRule);
    }

    #[test]
    fn test_rules_malformed_rhs() {
        // Two dangling expressions before the next rule.
        let err = rules_complete::<u64>(".cfa: $esp $ebp .ra: 0").unwrap_err();
        assert_eq!(err.kind, ParseExprErrorKind::DanglingOperands);
    }

    #[test]
    fn test_rule_display_roundtrip() {
        let input = ".cfa: $ebp 8 +";
        let parsed = rule_complete::<u32>(input).unwrap();
        assert_eq!(parsed.to_string(), input);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn arb_variable() -> impl Strategy<Value = Variable> {
            r"\$[a-zA-Z][a-zA-Z0-9]{0,8}".prop_map(Variable)
        }

        fn arb_constant() -> impl Strategy<Value = Constant> {
            r"\.?[a-zA-Z][a-zA-Z0-9_.]{0,8}".prop_map(Constant)
        }

        fn arb_binop() -> impl Strategy<Value = BinOp> {
            prop_oneof![
                Just(BinOp::Add),
                Just(BinOp::Sub),
                Just(BinOp::Mul),
                Just(BinOp::Div),
                Just(BinOp::Mod),
                Just(BinOp::Align),
            ]
        }

        fn arb_expr() -> impl Strategy<Value = Expr<u64>> {
            let leaf = prop_oneof![
                arb_variable().prop_map(Expr::Var),
                arb_constant().prop_map(Expr::Const),
                any::<u64>().prop_map(Expr::Value),
            ];

            leaf.prop_recursive(5, 10, 2, |inner| {
                prop_oneof![
                    (inner.clone(), inner.clone(), arb_binop()).prop_map(|(l, r, op)| {
                        Expr::Op(Box::new(l), Box::new(r), op)
                    }),
                    inner.prop_map(|x| Expr::Deref(Box::new(x))),
                ]
            })
        }

        proptest! {
            // Printing an expression and parsing it back must yield the same
            // tree; postfix notation has no ambiguity to exploit.
            #[test]
            fn proptest_expr_print_parse(e in arb_expr()) {
                let printed = e.to_string();
                let reparsed = expr_complete::<u64>(&printed).unwrap();
                prop_assert_eq!(reparsed, e);
            }

            #[test]
            fn proptest_rule_print_parse(i in arb_variable(), e in arb_expr()) {
                let rule = Rule(Identifier::Var(i), e);
                let printed = rule.to_string();
                let reparsed = rule_complete::<u64>(&printed).unwrap();
                prop_assert_eq!(reparsed, rule);
            }
        }
    }
}
