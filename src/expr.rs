use anyhow::Result;

use crate::error::ScoalError;

/// A resolved reference to a named scalar. Resolution happens once, at
/// compile time; evaluation only ever indexes slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarRef {
    Param(usize),
    Deme(usize),
    Aux(usize),
    Def(usize),
    Time,
}

/// Name tables an expression is compiled against. `defs` holds the
/// definitions declared so far, so later definitions can reference earlier
/// ones but not themselves.
pub struct Scope<'a> {
    pub params: &'a [String],
    pub demes: &'a [String],
    pub aux: &'a [String],
    pub defs: &'a [String],
    pub defs_dynamic: &'a [bool],
}

impl<'a> Scope<'a> {
    fn resolve(&self, name: &str) -> Option<VarRef> {
        if name == "t" {
            return Some(VarRef::Time);
        }
        if let Some(i) = self.params.iter().position(|p| p == name) {
            return Some(VarRef::Param(i));
        }
        if let Some(i) = self.demes.iter().position(|d| d == name) {
            return Some(VarRef::Deme(i));
        }
        if let Some(i) = self.aux.iter().position(|a| a == name) {
            return Some(VarRef::Aux(i));
        }
        if let Some(i) = self.defs.iter().position(|d| d == name) {
            return Some(VarRef::Def(i));
        }
        None
    }
}

/// Scalar bindings visible during one evaluation.
pub struct EvalEnv<'a> {
    pub params: &'a [f64],
    pub demes: &'a [f64],
    pub aux: &'a [f64],
    pub defs: &'a [f64],
    pub t: f64,
}

impl<'a> EvalEnv<'a> {
    fn get(&self, var: VarRef) -> f64 {
        match var {
            VarRef::Param(i) => self.params[i],
            VarRef::Deme(i) => self.demes[i],
            VarRef::Aux(i) => self.aux[i],
            VarRef::Def(i) => self.defs[i],
            VarRef::Time => self.t,
        }
    }
}

// ── tokens ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokKind {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
struct Tok {
    kind: TokKind,
    pos: usize,
}

fn parse_err(position: usize, msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Parse {
        position,
        msg: msg.into(),
    }
    .into()
}

fn tokenize(src: &str) -> Result<Vec<Tok>> {
    let bytes = src.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        let pos = i;
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'+' => {
                toks.push(Tok { kind: TokKind::Plus, pos });
                i += 1;
            }
            b'-' => {
                toks.push(Tok { kind: TokKind::Minus, pos });
                i += 1;
            }
            b'*' => {
                toks.push(Tok { kind: TokKind::Star, pos });
                i += 1;
            }
            b'/' => {
                toks.push(Tok { kind: TokKind::Slash, pos });
                i += 1;
            }
            b'^' => {
                toks.push(Tok { kind: TokKind::Caret, pos });
                i += 1;
            }
            b'(' => {
                toks.push(Tok { kind: TokKind::LParen, pos });
                i += 1;
            }
            b')' => {
                toks.push(Tok { kind: TokKind::RParen, pos });
                i += 1;
            }
            b',' => {
                toks.push(Tok { kind: TokKind::Comma, pos });
                i += 1;
            }
            b'=' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Tok { kind: TokKind::EqEq, pos });
                    i += 2;
                } else {
                    return Err(parse_err(pos, "single '=' is not an operator"));
                }
            }
            b'!' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Tok { kind: TokKind::NotEq, pos });
                    i += 2;
                } else {
                    return Err(parse_err(pos, "expected '!='"));
                }
            }
            b'<' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Tok { kind: TokKind::Le, pos });
                    i += 2;
                } else {
                    toks.push(Tok { kind: TokKind::Lt, pos });
                    i += 1;
                }
            }
            b'>' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    toks.push(Tok { kind: TokKind::Ge, pos });
                    i += 2;
                } else {
                    toks.push(Tok { kind: TokKind::Gt, pos });
                    i += 1;
                }
            }
            b'0'..=b'9' | b'.' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                // exponent suffix: 1e-3, 2.5E8
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        i = j;
                        while i < bytes.len() && bytes[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text = &src[start..i];
                let val: f64 = text
                    .parse()
                    .map_err(|_| parse_err(start, format!("bad number literal '{text}'")))?;
                toks.push(Tok { kind: TokKind::Num(val), pos: start });
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                toks.push(Tok {
                    kind: TokKind::Ident(src[start..i].to_string()),
                    pos: start,
                });
            }
            _ => return Err(parse_err(pos, format!("unexpected character '{}'", b as char))),
        }
    }
    Ok(toks)
}

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Exp,
    Log,
    Sqrt,
    Abs,
    Pow,
    Min,
    Max,
    Mod,
    If,
}

fn func_from_ident(name: &str) -> Option<(Func, usize)> {
    match name {
        "exp" => Some((Func::Exp, 1)),
        "log" => Some((Func::Log, 1)),
        "sqrt" => Some((Func::Sqrt, 1)),
        "abs" => Some((Func::Abs, 1)),
        "pow" => Some((Func::Pow, 2)),
        "min" => Some((Func::Min, 2)),
        "max" => Some((Func::Max, 2)),
        "mod" => Some((Func::Mod, 2)),
        "if" => Some((Func::If, 3)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Ast {
    Num(f64),
    Var(VarRef),
    Neg(Box<Ast>),
    Bin(BinOp, Box<Ast>, Box<Ast>),
    Call(Func, Vec<Ast>),
}

struct Parser<'a, 's> {
    toks: &'a [Tok],
    pos: usize,
    end: usize,
    scope: &'a Scope<'s>,
}

impl<'a, 's> Parser<'a, 's> {
    fn peek(&self) -> Option<&TokKind> {
        self.toks.get(self.pos).map(|t| &t.kind)
    }

    fn here(&self) -> usize {
        self.toks.get(self.pos).map(|t| t.pos).unwrap_or(self.end)
    }

    fn bump(&mut self) -> Option<&Tok> {
        let t = self.toks.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, kind: &TokKind, what: &str) -> Result<()> {
        match self.toks.get(self.pos) {
            Some(t) if t.kind == *kind => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(parse_err(self.here(), format!("expected {what}"))),
        }
    }

    fn parse_cmp(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Some(TokKind::EqEq) => BinOp::Eq,
                Some(TokKind::NotEq) => BinOp::Ne,
                Some(TokKind::Lt) => BinOp::Lt,
                Some(TokKind::Le) => BinOp::Le,
                Some(TokKind::Gt) => BinOp::Gt,
                Some(TokKind::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_add()?;
            lhs = Ast::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(TokKind::Plus) => BinOp::Add,
                Some(TokKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_mul()?;
            lhs = Ast::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(TokKind::Star) => BinOp::Mul,
                Some(TokKind::Slash) => BinOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Ast::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        if matches!(self.peek(), Some(TokKind::Minus)) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Ast::Neg(Box::new(inner)));
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> Result<Ast> {
        let base = self.parse_atom()?;
        if matches!(self.peek(), Some(TokKind::Caret)) {
            self.bump();
            // right-associative; the operand may carry a unary minus (2^-3)
            let exponent = self.parse_unary()?;
            return Ok(Ast::Bin(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Ast> {
        let pos = self.here();
        let tok = match self.bump() {
            Some(t) => t.clone(),
            None => return Err(parse_err(pos, "unexpected end of expression")),
        };
        match tok.kind {
            TokKind::Num(v) => Ok(Ast::Num(v)),
            TokKind::LParen => {
                let inner = self.parse_cmp()?;
                self.expect(&TokKind::RParen, "')'")?;
                Ok(inner)
            }
            TokKind::Ident(name) => {
                if matches!(self.peek(), Some(TokKind::LParen)) {
                    self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(TokKind::RParen)) {
                        loop {
                            args.push(self.parse_cmp()?);
                            if matches!(self.peek(), Some(TokKind::Comma)) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&TokKind::RParen, "')'")?;
                    let (func, arity) = func_from_ident(&name).ok_or_else(|| {
                        parse_err(tok.pos, format!("unknown function '{name}'"))
                    })?;
                    if args.len() != arity {
                        return Err(parse_err(
                            tok.pos,
                            format!("{name} takes {arity} argument(s), got {}", args.len()),
                        ));
                    }
                    Ok(Ast::Call(func, args))
                } else {
                    let var = self.scope.resolve(&name).ok_or_else(|| {
                        anyhow::Error::from(ScoalError::Name { ident: name.clone() })
                    })?;
                    Ok(Ast::Var(var))
                }
            }
            other => Err(parse_err(tok.pos, format!("unexpected token {other:?}"))),
        }
    }
}

// ── instruction stream ─────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Instr {
    Const(f64),
    Load(VarRef),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Exp,
    Log,
    Sqrt,
    Abs,
    Min,
    Max,
    Mod,
    /// Pops (else, then, cond); pushes `then` when cond > 0.
    Select,
}

#[derive(Debug, Clone)]
pub struct CompiledExpr {
    code: Vec<Instr>,
    dynamic: bool,
}

fn emit(ast: &Ast, code: &mut Vec<Instr>, scope: &Scope, dynamic: &mut bool) {
    match ast {
        Ast::Num(v) => code.push(Instr::Const(*v)),
        Ast::Var(var) => {
            match *var {
                VarRef::Deme(_) | VarRef::Aux(_) | VarRef::Time => *dynamic = true,
                VarRef::Def(i) => {
                    if scope.defs_dynamic.get(i).copied().unwrap_or(false) {
                        *dynamic = true;
                    }
                }
                VarRef::Param(_) => {}
            }
            code.push(Instr::Load(*var));
        }
        Ast::Neg(inner) => {
            emit(inner, code, scope, dynamic);
            code.push(Instr::Neg);
        }
        Ast::Bin(op, lhs, rhs) => {
            emit(lhs, code, scope, dynamic);
            emit(rhs, code, scope, dynamic);
            code.push(match op {
                BinOp::Add => Instr::Add,
                BinOp::Sub => Instr::Sub,
                BinOp::Mul => Instr::Mul,
                BinOp::Div => Instr::Div,
                BinOp::Pow => Instr::Pow,
                BinOp::Eq => Instr::Eq,
                BinOp::Ne => Instr::Ne,
                BinOp::Lt => Instr::Lt,
                BinOp::Le => Instr::Le,
                BinOp::Gt => Instr::Gt,
                BinOp::Ge => Instr::Ge,
            });
        }
        Ast::Call(func, args) => {
            for a in args {
                emit(a, code, scope, dynamic);
            }
            code.push(match func {
                Func::Exp => Instr::Exp,
                Func::Log => Instr::Log,
                Func::Sqrt => Instr::Sqrt,
                Func::Abs => Instr::Abs,
                Func::Pow => Instr::Pow,
                Func::Min => Instr::Min,
                Func::Max => Instr::Max,
                Func::Mod => Instr::Mod,
                Func::If => Instr::Select,
            });
        }
    }
}

impl CompiledExpr {
    pub fn compile(src: &str, scope: &Scope) -> Result<Self> {
        let toks = tokenize(src)?;
        let mut parser = Parser {
            toks: &toks,
            pos: 0,
            end: src.len(),
            scope,
        };
        let ast = parser.parse_cmp()?;
        if parser.pos < toks.len() {
            return Err(parse_err(parser.here(), "unexpected trailing tokens"));
        }
        let mut code = Vec::new();
        let mut dynamic = false;
        emit(&ast, &mut code, scope, &mut dynamic);
        Ok(CompiledExpr { code, dynamic })
    }

    /// True when the value can change with state or time; a non-dynamic
    /// expression is fixed once parameters are bound.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Evaluates against `env`. `stack` is caller-provided scratch, reused
    /// across the many evaluations of one integration pass.
    pub fn eval(&self, env: &EvalEnv, stack: &mut Vec<f64>) -> f64 {
        stack.clear();
        for instr in &self.code {
            match *instr {
                Instr::Const(v) => stack.push(v),
                Instr::Load(var) => stack.push(env.get(var)),
                Instr::Neg => {
                    let a = stack.pop().unwrap_or(f64::NAN);
                    stack.push(-a);
                }
                Instr::Add => bin(stack, |a, b| a + b),
                Instr::Sub => bin(stack, |a, b| a - b),
                Instr::Mul => bin(stack, |a, b| a * b),
                Instr::Div => bin(stack, |a, b| a / b),
                Instr::Pow => bin(stack, f64::powf),
                Instr::Eq => bin(stack, |a, b| f64::from(a == b)),
                Instr::Ne => bin(stack, |a, b| f64::from(a != b)),
                Instr::Lt => bin(stack, |a, b| f64::from(a < b)),
                Instr::Le => bin(stack, |a, b| f64::from(a <= b)),
                Instr::Gt => bin(stack, |a, b| f64::from(a > b)),
                Instr::Ge => bin(stack, |a, b| f64::from(a >= b)),
                Instr::Exp => un(stack, f64::exp),
                Instr::Log => un(stack, f64::ln),
                Instr::Sqrt => un(stack, f64::sqrt),
                Instr::Abs => un(stack, f64::abs),
                Instr::Min => bin(stack, f64::min),
                Instr::Max => bin(stack, f64::max),
                Instr::Mod => bin(stack, |a, b| a % b),
                Instr::Select => {
                    let else_v = stack.pop().unwrap_or(f64::NAN);
                    let then_v = stack.pop().unwrap_or(f64::NAN);
                    let cond = stack.pop().unwrap_or(f64::NAN);
                    stack.push(if cond > 0.0 { then_v } else { else_v });
                }
            }
        }
        stack.pop().unwrap_or(f64::NAN)
    }
}

#[inline]
fn bin(stack: &mut Vec<f64>, f: impl Fn(f64, f64) -> f64) {
    let b = stack.pop().unwrap_or(f64::NAN);
    let a = stack.pop().unwrap_or(f64::NAN);
    stack.push(f(a, b));
}

#[inline]
fn un(stack: &mut Vec<f64>, f: impl Fn(f64) -> f64) {
    let a = stack.pop().unwrap_or(f64::NAN);
    stack.push(f(a));
}
