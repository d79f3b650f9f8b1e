use crate::errors::PathError;
use crate::traits::{PeriodResidual, Scalar};
use std::collections::HashMap;

/// OpCodes for the stack-based virtual machine that evaluates compiled model
/// equations. The VM operates on a stack of `Scalar` values (f64 or Dual).
///
/// Variable references carry a time tag: in the model text a variable `x` is
/// addressed as `xLag` (t-1), `x` (t), `xPrime` (t+1) or `xSS` (steady state).
#[derive(Debug, Clone, Copy)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    Const(f64),
    /// Pushes a variable's lagged value (by index).
    Lag(usize),
    /// Pushes a variable's current value.
    Now(usize),
    /// Pushes a variable's lead value.
    Lead(usize),
    /// Pushes a variable's steady-state value.
    Steady(usize),
    /// Pushes the realized value of a shock.
    Shock(usize),
    /// Pushes a parameter value.
    Param(usize),
    /// Pushes the value of an aux binding evaluated earlier this period.
    Aux(usize),
    /// Pops (b, a), pushes a + b.
    Add,
    /// Pops (b, a), pushes a - b.
    Sub,
    /// Pops (b, a), pushes a * b.
    Mul,
    /// Pops (b, a), pushes a / b.
    Div,
    /// Pops (b, a), pushes a ^ b.
    Pow,
    /// Pops a, pushes -a.
    Neg,
    Exp,
    Ln,
    Sqrt,
    Sin,
    Cos,
    Tanh,
    Abs,
}

/// A compiled sequence of operations evaluating to one value.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stateless VM. `stack` is a caller-owned buffer for intermediates so the
/// compiled model stays `Sync` and worker lanes can evaluate concurrently.
pub struct Vm;

impl Vm {
    #[allow(clippy::too_many_arguments)]
    pub fn execute<T: Scalar>(
        code: &Bytecode,
        lag: &[T],
        now: &[T],
        lead: &[T],
        steady: &[T],
        shocks: &[T],
        params: &[T],
        aux: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &code.ops {
            match *op {
                OpCode::Const(v) => stack.push(T::from_f64(v).unwrap()),
                OpCode::Lag(i) => stack.push(lag[i]),
                OpCode::Now(i) => stack.push(now[i]),
                OpCode::Lead(i) => stack.push(lead[i]),
                OpCode::Steady(i) => stack.push(steady[i]),
                OpCode::Shock(i) => stack.push(shocks[i]),
                OpCode::Param(i) => stack.push(params[i]),
                OpCode::Aux(i) => stack.push(aux[i]),
                OpCode::Add => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a.powf(b));
                }
                OpCode::Neg => {
                    let a = stack.pop().unwrap();
                    stack.push(-a);
                }
                OpCode::Exp => {
                    let a = stack.pop().unwrap();
                    stack.push(a.exp());
                }
                OpCode::Ln => {
                    let a = stack.pop().unwrap();
                    stack.push(a.ln());
                }
                OpCode::Sqrt => {
                    let a = stack.pop().unwrap();
                    stack.push(a.sqrt());
                }
                OpCode::Sin => {
                    let a = stack.pop().unwrap();
                    stack.push(a.sin());
                }
                OpCode::Cos => {
                    let a = stack.pop().unwrap();
                    stack.push(a.cos());
                }
                OpCode::Tanh => {
                    let a = stack.pop().unwrap();
                    stack.push(a.tanh());
                }
                OpCode::Abs => {
                    let a = stack.pop().unwrap();
                    stack.push(a.abs());
                }
            }
        }

        // Balanced bytecode leaves exactly one value.
        stack.pop().unwrap_or_else(|| T::from_f64(0.0).unwrap())
    }
}

// --- AST & parser ---

#[derive(Debug)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, PathError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num.is_empty() {
                    // Scientific notation; the sign is part of the literal.
                    let mut ahead = chars.clone();
                    ahead.next();
                    match ahead.peek() {
                        Some(&s) if s.is_ascii_digit() || s == '+' || s == '-' => {
                            num.push(d);
                            chars.next();
                            let &s = chars.peek().unwrap();
                            if s == '+' || s == '-' {
                                num.push(s);
                                chars.next();
                            }
                        }
                        _ => break,
                    }
                } else {
                    break;
                }
            }
            let value = num
                .parse()
                .map_err(|_| PathError::Compile(format!("Invalid number literal '{num}'")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(ident));
        } else {
            match c {
                '+' => tokens.push(Token::Plus),
                '-' => tokens.push(Token::Minus),
                '*' => tokens.push(Token::Star),
                '/' => tokens.push(Token::Slash),
                '^' => tokens.push(Token::Caret),
                '(' => tokens.push(Token::LParen),
                ')' => tokens.push(Token::RParen),
                _ => {
                    return Err(PathError::Compile(format!(
                        "Unexpected character '{c}' in expression"
                    )))
                }
            }
            chars.next();
        }
    }
    Ok(tokens)
}

/// Parses a single expression (no `=`) into an AST.
pub fn parse_expr(input: &str) -> Result<Expr, PathError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_sum()?;
    if parser.pos != parser.tokens.len() {
        return Err(PathError::Compile(format!(
            "Trailing tokens in expression '{input}'"
        )));
    }
    Ok(expr)
}

/// Parses an equation. `lhs = rhs` normalizes to the residual `lhs - (rhs)`;
/// a bare expression is already a residual.
pub fn parse_equation(input: &str) -> Result<Expr, PathError> {
    match input.split_once('=') {
        Some((lhs, rhs)) => {
            if rhs.contains('=') {
                return Err(PathError::Compile(format!(
                    "Equation '{input}' contains more than one '='"
                )));
            }
            let l = parse_expr(lhs)?;
            let r = parse_expr(rhs)?;
            Ok(Expr::Binary(Box::new(l), '-', Box::new(r)))
        }
        None => parse_expr(input),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_sum(&mut self) -> Result<Expr, PathError> {
        let mut left = self.parse_product()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.next();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, PathError> {
        let mut left = self.parse_power()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.next();
            let right = self.parse_power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, PathError> {
        let base = self.parse_unary()?;
        if let Some(Token::Caret) = self.peek() {
            self.next();
            // Right-associative.
            let exponent = self.parse_power()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, PathError> {
        if let Some(Token::Minus) = self.peek() {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, PathError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.next();
                    let arg = self.parse_sum()?;
                    match self.next() {
                        Some(Token::RParen) => Ok(Expr::Call(name, Box::new(arg))),
                        _ => Err(PathError::Compile(format!(
                            "Expected ')' after argument of '{name}'"
                        ))),
                    }
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_sum()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(PathError::Compile("Expected ')'".to_string())),
                }
            }
            other => Err(PathError::Compile(format!(
                "Unexpected token {other:?} in expression"
            ))),
        }
    }
}

// --- Compiler ---

/// Compiles ASTs into `Bytecode`, resolving identifiers against the model's
/// variable, shock, parameter and aux-binding names. Variable references are
/// tagged by suffix: `xLag`, `x`, `xPrime`, `xSS`.
pub struct Compiler {
    vars: HashMap<String, usize>,
    shocks: HashMap<String, usize>,
    params: HashMap<String, usize>,
    aux: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], shock_names: &[String], param_names: &[String]) -> Self {
        let index = |names: &[String]| {
            names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), i))
                .collect::<HashMap<_, _>>()
        };
        Self {
            vars: index(var_names),
            shocks: index(shock_names),
            params: index(param_names),
            aux: HashMap::new(),
        }
    }

    /// Registers an aux binding; later expressions may refer to it by name.
    pub fn bind_aux(&mut self, name: &str) -> Result<usize, PathError> {
        if self.vars.contains_key(name)
            || self.shocks.contains_key(name)
            || self.params.contains_key(name)
            || self.aux.contains_key(name)
        {
            return Err(PathError::Compile(format!(
                "Aux binding '{name}' shadows an existing name"
            )));
        }
        let slot = self.aux.len();
        self.aux.insert(name.to_string(), slot);
        Ok(slot)
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, PathError> {
        let mut ops = Vec::new();
        self.emit(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn resolve(&self, name: &str) -> Result<OpCode, PathError> {
        if let Some(&i) = self.vars.get(name) {
            return Ok(OpCode::Now(i));
        }
        for (suffix, tag) in [
            ("Lag", OpCode::Lag as fn(usize) -> OpCode),
            ("Prime", OpCode::Lead as fn(usize) -> OpCode),
            ("SS", OpCode::Steady as fn(usize) -> OpCode),
        ] {
            if let Some(stem) = name.strip_suffix(suffix) {
                if let Some(&i) = self.vars.get(stem) {
                    return Ok(tag(i));
                }
            }
        }
        if let Some(&i) = self.shocks.get(name) {
            return Ok(OpCode::Shock(i));
        }
        if let Some(&i) = self.params.get(name) {
            return Ok(OpCode::Param(i));
        }
        if let Some(&i) = self.aux.get(name) {
            return Ok(OpCode::Aux(i));
        }
        Err(PathError::Compile(format!(
            "Unknown variable, shock or parameter: '{name}'"
        )))
    }

    fn emit(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), PathError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::Const(*n)),
            Expr::Ident(name) => ops.push(self.resolve(name)?),
            Expr::Binary(left, op, right) => {
                self.emit(left, ops)?;
                self.emit(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => {
                        return Err(PathError::Compile(format!("Unknown binary operator '{op}'")))
                    }
                });
            }
            Expr::Unary(op, inner) => {
                self.emit(inner, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => return Err(PathError::Compile(format!("Unknown unary operator '{op}'"))),
                }
            }
            Expr::Call(func, arg) => {
                self.emit(arg, ops)?;
                ops.push(match func.as_str() {
                    "exp" => OpCode::Exp,
                    "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tanh" => OpCode::Tanh,
                    "abs" => OpCode::Abs,
                    _ => return Err(PathError::Compile(format!("Unknown function '{func}'"))),
                });
            }
        }
        Ok(())
    }
}

// --- Compiled model equations ---

/// The compiled residual function: one bytecode program per model equation,
/// preceded by the aux bindings which are evaluated once per period in
/// declaration order. Implements `PeriodResidual` for any `Scalar`, so the
/// same compiled model serves both plain evaluation and dual-number
/// differentiation.
#[derive(Debug)]
pub struct ModelEquations {
    nvars: usize,
    aux: Vec<Bytecode>,
    equations: Vec<Bytecode>,
}

impl ModelEquations {
    /// Compiles aux bindings (`name = expr`) and equations against the given
    /// name spaces. Equation count must equal variable count; that is checked
    /// by the caller which has the model context for a good error message.
    pub fn compile(
        var_names: &[String],
        shock_names: &[String],
        param_names: &[String],
        aux_equations: &[String],
        equations: &[String],
    ) -> Result<Self, PathError> {
        let mut compiler = Compiler::new(var_names, shock_names, param_names);

        let mut aux = Vec::with_capacity(aux_equations.len());
        for binding in aux_equations {
            let (name, expr_text) = binding.split_once('=').ok_or_else(|| {
                PathError::Compile(format!("Aux equation '{binding}' must have the form name = expr"))
            })?;
            let expr = parse_expr(expr_text)?;
            let code = compiler.compile(&expr)?;
            compiler.bind_aux(name.trim())?;
            aux.push(code);
        }

        let mut compiled = Vec::with_capacity(equations.len());
        for eqn in equations {
            let expr = parse_equation(eqn)?;
            compiled.push(compiler.compile(&expr)?);
        }

        Ok(Self {
            nvars: var_names.len(),
            aux,
            equations: compiled,
        })
    }

    /// True if variable `i` is referenced at the current period in at least
    /// one equation or aux binding. A variable only appearing as `xLag`,
    /// `xPrime` or `xSS` cannot pin down a root.
    pub fn references_current(&self, i: usize) -> bool {
        self.aux
            .iter()
            .chain(self.equations.iter())
            .flat_map(|code| code.ops.iter())
            .any(|op| matches!(op, OpCode::Now(j) if *j == i))
    }
}

impl<T: Scalar> PeriodResidual<T> for ModelEquations {
    fn nvars(&self) -> usize {
        self.nvars
    }

    fn eval(
        &self,
        lag: &[T],
        now: &[T],
        lead: &[T],
        steady: &[T],
        shocks: &[T],
        params: &[T],
        out: &mut [T],
        scratch: &mut Vec<T>,
    ) {
        let mut aux_vals: Vec<T> = Vec::with_capacity(self.aux.len());
        for code in &self.aux {
            let value = Vm::execute(code, lag, now, lead, steady, shocks, params, &aux_vals, scratch);
            aux_vals.push(value);
        }
        for (i, code) in self.equations.iter().enumerate() {
            out[i] = Vm::execute(code, lag, now, lead, steady, shocks, params, &aux_vals, scratch);
        }
    }
}
