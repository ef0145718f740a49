//! Functionality for evaluating CFI rule programs.
//!
//! Rule programs are postfix
//! ([RPN](https://en.wikipedia.org/wiki/Reverse_Polish_notation)) expressions
//! bound to register names. A rule set like
//!
//! ```text
//! .cfa: $esp 8 + $eip: .cfa 4 - ^ $ebp: .cfa 8 - ^
//! ```
//!
//! describes how to compute the caller's registers from the callee's. The
//! expression grammar is defined by the following
//! [BNF](https://en.wikipedia.org/wiki/Backus%E2%80%93Naur_form) specification:
//!
//! ```text
//! <rule>     ::=  <ident>: <expr>
//! <ident>    ::=  <constant> | <variable>
//! <expr>     ::=  <constant> | <variable> | <literal> | <expr> <expr> <binop> | <expr> ^
//! <constant> ::=  [a-zA-Z_.][a-zA-Z0-9_.]*
//! <variable> ::=  $[a-zA-Z][a-zA-Z0-9]*
//! <binop>    ::=  + | - | * | / | % | @
//! <literal>  ::=  -?([0-9]+ | 0x[0-9a-fA-F]+)
//! ```
//!
//! The symbol `^` denotes a dereference operation: assuming a region of stack
//! memory `m` is available, `x ^` evaluates to `m[x]`. If no memory is
//! available or `m` is not defined at `x`, the expression's value is
//! undefined. The symbol `@` truncates its first operand to a multiple of its
//! second operand.
//!
//! Two identifiers have fixed meaning: the pseudo-register `.cfa` is the
//! canonical frame address and is always evaluated before any other rule so
//! that other rules may refer to it; `.ra` is the caller's return address.
//! The constant `.undef` makes the value of any expression containing it
//! explicitly unknown.
//!
//! Constants and variables are evaluated by referring to dictionaries
//! (concretely: [`BTreeMap`]s) seeded with the callee's registers. An
//! expression referring to an identifier missing from both dictionaries has
//! an undefined value. Undefined values, out-of-range dereferences, division
//! by zero, and malformed programs all surface as errors; the caller treats
//! them as "this rule set did not apply".

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::base::{Endianness, RegisterValue};
use crate::memory::MemoryRegion;

pub mod parsing;

use parsing::ParseExprError;

/// The name of the canonical frame address pseudo-register.
const CFA: &str = ".cfa";

/// The name of the return address pseudo-register.
const RA: &str = ".ra";

/// The constant marking an explicitly undefined value.
const UNDEF: &str = ".undef";

/// A variable, named with a `$` prefix.
///
/// On x86 and x86-64, general purpose registers appear in rule programs as
/// variables (`$esp`, `$rip`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(pub(crate) String);

impl Variable {
    /// Returns the name of this variable, including the `$` prefix.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Variable {
    type Err = ParseExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parsing::variable_complete(input)
    }
}

/// A constant value, named without a `$` prefix.
///
/// This covers the pseudo-registers `.cfa` and `.ra` as well as bare register
/// names on architectures that do not use the `$` prefix (`sp`, `x29`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Constant(pub(crate) String);

impl Constant {
    /// The canonical frame address pseudo-register `.cfa`.
    pub fn cfa() -> Self {
        Constant(CFA.to_string())
    }

    /// The return address pseudo-register `.ra`.
    pub fn ra() -> Self {
        Constant(RA.to_string())
    }

    /// Returns the name of this constant.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the `.undef` marker.
    pub fn is_undef(&self) -> bool {
        self.0 == UNDEF
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Constant {
    type Err = ParseExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parsing::constant_complete(input)
    }
}

/// A variable or constant, as it appears on the left-hand side of a rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    /// A variable.
    Var(Variable),
    /// A constant.
    Const(Constant),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Var(v) => v.fmt(f),
            Self::Const(c) => c.fmt(f),
        }
    }
}

/// A binary operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Mod,
    /// Alignment.
    ///
    /// Truncates the first operand to a multiple of the second operand.
    Align,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Add => write!(f, "+"),
            Self::Sub => write!(f, "-"),
            Self::Mul => write!(f, "*"),
            Self::Div => write!(f, "/"),
            Self::Mod => write!(f, "%"),
            Self::Align => write!(f, "@"),
        }
    }
}

/// An expression.
///
/// This is generic so that both 32-bit and 64-bit number types can be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr<T> {
    /// A literal value.
    Value(T),
    /// A named constant.
    Const(Constant),
    /// A variable.
    Var(Variable),
    /// An expression `a b §`, where `§` is a [binary operator](BinOp).
    Op(Box<Expr<T>>, Box<Expr<T>>, BinOp),
    /// A dereferenced subexpression.
    Deref(Box<Expr<T>>),
}

impl<T: fmt::Display> fmt::Display for Expr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Value(n) => write!(f, "{}", n),
            Self::Const(c) => write!(f, "{}", c),
            Self::Var(v) => write!(f, "{}", v),
            Self::Op(x, y, op) => write!(f, "{} {} {}", x, y, op),
            Self::Deref(x) => write!(f, "{} ^", x),
        }
    }
}

impl<T: RegisterValue> FromStr for Expr<T> {
    type Err = ParseExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parsing::expr_complete(input)
    }
}

/// A rule `i: e` assigning the value of expression `e` to identifier `i` in
/// the caller frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule<T>(pub Identifier, pub Expr<T>);

impl<T> Rule<T> {
    /// The identifier this rule computes.
    pub fn identifier(&self) -> &Identifier {
        &self.0
    }

    /// The expression computing the identifier's value.
    pub fn expr(&self) -> &Expr<T> {
        &self.1
    }
}

impl<T: fmt::Display> fmt::Display for Rule<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.1)
    }
}

impl<T: RegisterValue> FromStr for Rule<T> {
    type Err = ParseExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parsing::rule_complete(input)
    }
}

/// An error encountered while evaluating an expression.
#[derive(Debug)]
pub enum EvaluationError<A> {
    /// The expression contains a constant with no known value.
    UndefinedConstant(Constant),

    /// The expression contains a variable with no known value.
    UndefinedVariable(Variable),

    /// The expression contains the `.undef` marker; its value is explicitly
    /// unknown.
    UndefinedValue,

    /// The expression contains a dereference, but the evaluator has no
    /// memory to read from.
    MemoryUnavailable,

    /// The requested read would exceed the bounds of the memory region.
    IllegalMemoryAccess {
        /// The number of bytes of the attempted read.
        bytes: usize,
        /// The address at which the read was attempted.
        address: A,
        /// The range of available addresses.
        address_range: Range<u64>,
    },

    /// The expression divides or takes a remainder by zero.
    DivisionByZero,

    /// The rule set contains no rule for the canonical frame address.
    MissingCfaRule,
}

impl<A: fmt::Display> fmt::Display for EvaluationError<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UndefinedConstant(c) => write!(f, "constant {} is not defined", c),
            Self::UndefinedVariable(v) => write!(f, "variable {} is not defined", v),
            Self::UndefinedValue => write!(f, "the expression is explicitly undefined"),
            Self::MemoryUnavailable => write!(f, "the evaluator does not have access to memory"),
            Self::IllegalMemoryAccess {
                bytes,
                address,
                address_range,
            } => write!(
                f,
                "tried to read {} bytes at address {}, but the available range is [{:#x}, {:#x})",
                bytes, address, address_range.start, address_range.end
            ),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::MissingCfaRule => write!(f, "no rule recovers the canonical frame address"),
        }
    }
}

impl<A: fmt::Display + fmt::Debug> Error for EvaluationError<A> {}

/// Structure that encapsulates the information necessary to evaluate CFI
/// rule programs.
///
/// It is generic over an address type `A` (the register width of the
/// architecture being unwound) and an [`Endianness`] that controls how values
/// are read from memory.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use retrace_unwind::evaluator::{Constant, Evaluator, Identifier};
/// use retrace_unwind::{LittleEndian, MemoryRegion};
///
/// let memory = MemoryRegion {
///     base_addr: 0x1000,
///     contents: &[0x34, 0x12, 0, 0, 0xcc, 0xcc, 0xcc, 0xcc],
/// };
///
/// let mut constants = BTreeMap::new();
/// constants.insert("sp".parse::<Constant>().unwrap(), 0x1000u32);
///
/// let mut evaluator = Evaluator::new(LittleEndian)
///     .memory(memory)
///     .constants(constants);
///
/// evaluator.add_cfi_rules_string(".cfa: sp 8 + .ra: .cfa 8 - ^").unwrap();
/// let caller = evaluator.evaluate_cfi_rules().unwrap();
///
/// assert_eq!(caller[&Identifier::Const(Constant::ra())], 0x1234);
/// ```
pub struct Evaluator<'memory, A, E> {
    /// A region of stack memory.
    ///
    /// If this is `None`, evaluation of expressions containing dereference
    /// operations will fail.
    memory: Option<MemoryRegion<'memory>>,

    /// A map containing the values of constants.
    ///
    /// Evaluating a constant that is in neither this map nor the computed
    /// rule results causes evaluation to fail.
    constants: BTreeMap<Constant, A>,

    /// A map containing the values of variables.
    variables: BTreeMap<Variable, A>,

    /// The rules accumulated by [`add_cfi_rules_string`](Self::add_cfi_rules_string),
    /// in insertion order. A later rule for the same identifier overrides an
    /// earlier one.
    cfi_rules: Vec<Rule<A>>,

    /// The endianness the evaluator uses to read data from memory.
    endian: E,
}

impl<'memory, A, E> Evaluator<'memory, A, E> {
    /// Creates an evaluator with the given endianness, no memory, and empty
    /// constant and variable maps.
    pub fn new(endian: E) -> Self {
        Self {
            memory: None,
            constants: BTreeMap::new(),
            variables: BTreeMap::new(),
            cfi_rules: Vec::new(),
            endian,
        }
    }

    /// Sets the evaluator's memory to the given `MemoryRegion`.
    pub fn memory(mut self, memory: MemoryRegion<'memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Sets the evaluator's constant map to the given map.
    pub fn constants(mut self, constants: BTreeMap<Constant, A>) -> Self {
        self.constants = constants;
        self
    }

    /// Sets the evaluator's variable map to the given map.
    pub fn variables(mut self, variables: BTreeMap<Variable, A>) -> Self {
        self.variables = variables;
        self
    }
}

impl<'memory, A: RegisterValue, E: Endianness> Evaluator<'memory, A, E> {
    /// Evaluates a single expression.
    ///
    /// This may fail if the expression tries to dereference unavailable
    /// memory or uses undefined constants or variables.
    pub fn evaluate(&self, expr: &Expr<A>) -> Result<A, EvaluationError<A>> {
        match expr {
            Expr::Value(x) => Ok(*x),
            Expr::Const(c) => {
                if c.is_undef() {
                    return Err(EvaluationError::UndefinedValue);
                }
                self.constants
                    .get(c)
                    .copied()
                    .ok_or_else(|| EvaluationError::UndefinedConstant(c.clone()))
            }
            Expr::Var(v) => self
                .variables
                .get(v)
                .copied()
                .ok_or_else(|| EvaluationError::UndefinedVariable(v.clone())),
            Expr::Op(e1, e2, op) => {
                let e1 = self.evaluate(e1)?;
                let e2 = self.evaluate(e2)?;
                match op {
                    BinOp::Add => Ok(e1.wrapping_add(e2)),
                    BinOp::Sub => Ok(e1.wrapping_sub(e2)),
                    BinOp::Mul => Ok(e1.wrapping_mul(e2)),
                    BinOp::Div => e1.checked_div(e2).ok_or(EvaluationError::DivisionByZero),
                    BinOp::Mod => e1.checked_rem(e2).ok_or(EvaluationError::DivisionByZero),
                    BinOp::Align => e1
                        .checked_div(e2)
                        .map(|q| q.wrapping_mul(e2))
                        .ok_or(EvaluationError::DivisionByZero),
                }
            }
            Expr::Deref(address) => {
                let address = self.evaluate(address)?;
                let memory = self
                    .memory
                    .as_ref()
                    .ok_or(EvaluationError::MemoryUnavailable)?;
                memory
                    .get(address.into_u64(), self.endian)
                    .ok_or(EvaluationError::IllegalMemoryAccess {
                        address,
                        bytes: A::WIDTH,
                        address_range: memory.base_addr..memory.end_addr(),
                    })
            }
        }
    }

    /// Parses a string of rules and appends them to this evaluator's rule set.
    ///
    /// Call this once with the covering record's initial rules and then once
    /// per applicable delta; later rules for the same identifier override
    /// earlier ones.
    pub fn add_cfi_rules_string(&mut self, rules_string: &str) -> Result<(), ParseExprError> {
        self.cfi_rules
            .extend(parsing::rules_complete(rules_string)?);
        Ok(())
    }

    /// Evaluates all accumulated rules and returns the recovered identifiers.
    ///
    /// The `.cfa` rule is evaluated first and its result made available to
    /// all other rules. A missing or failing `.cfa` rule and a failing `.ra`
    /// rule are errors. Rules for other registers that fail to evaluate are
    /// dropped from the result; downstream consumers treat those registers as
    /// unrecovered.
    pub fn evaluate_cfi_rules(
        &mut self,
    ) -> Result<BTreeMap<Identifier, A>, EvaluationError<A>> {
        // Later rules override earlier ones, so collapse in insertion order.
        let mut effective: BTreeMap<Identifier, Expr<A>> = BTreeMap::new();
        for Rule(ident, expr) in self.cfi_rules.drain(..) {
            effective.insert(ident, expr);
        }

        let cfa_ident = Identifier::Const(Constant::cfa());
        let cfa_expr = effective
            .remove(&cfa_ident)
            .ok_or(EvaluationError::MissingCfaRule)?;

        let cfa = self.evaluate(&cfa_expr)?;
        self.constants.insert(Constant::cfa(), cfa);

        let mut caller_registers = BTreeMap::new();
        caller_registers.insert(cfa_ident, cfa);

        for (ident, expr) in effective {
            match self.evaluate(&expr) {
                Ok(value) => {
                    caller_registers.insert(ident, value);
                }
                Err(error) => {
                    if ident == Identifier::Const(Constant::ra()) {
                        return Err(error);
                    }
                    // Losing a general purpose register is not fatal.
                }
            }
        }

        Ok(caller_registers)
    }
}
