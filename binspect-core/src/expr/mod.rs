//! The expression VM: evaluates a template's small expression language
//! against the inspection tree being built.
//!
//! Expressions arrive pre-compiled to postfix bytecode (`Program`) by the
//! template parser (out of scope here; see `spec.md` §1). This module only
//! executes that bytecode. The stack machine itself never finalizes a branch
//! on its own — finalization is applied explicitly by the operations that
//! actually need a scalar (arithmetic, comparisons, scalar-taking builtins)
//! and once more by [`eval`] on the way out, so a bare `this.count` used as a
//! whole expression still comes back as a number. `Op::AddressOf` sidesteps
//! that final step by running its embedded sub-program through [`run`]
//! directly, which is how `@path` keeps a branch un-finalized.

mod builtins;

pub use builtins::Builtin;

use crate::bitreader::BitReader;
use crate::forest::{Forest, NodeId};
use crate::position::Position;
use crate::value::{decode, AtomBaseType, Endianness, ValueError};
use std::sync::Arc;
use thiserror::Error;

pub type Program = Arc<[Op]>;

#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Number(f64),
    Str(Arc<str>),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Const(Const),
    LoadThis,
    LoadMain,
    LoadName(Arc<str>),
    GetField(Arc<str>),
    Index,
    AddressOf(Program),
    Neg,
    Not,
    Arith(ArithOp),
    Compare(CompareOp),
    /// Short-circuiting `&&`: the left operand is ordinary preceding bytecode
    /// (already on the stack by the time this op runs), but the right
    /// operand is an embedded sub-program, run only if the left operand
    /// didn't already decide the result — the same lazy-evaluation trick
    /// `AddressOf` uses, applied to boolean short-circuit instead.
    And(Program),
    Or(Program),
    JumpIfFalsy(usize),
    Jump(usize),
    Pop,
    Call(Builtin, u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Str(String),
    Position(Position),
    Branch(NodeId),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("no subfield named `{name}` on `{parent}`")]
    SubfieldNotFound { parent: String, name: String },

    #[error("array index {index} out of range (len {len})")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("`{builtin}` expected a {expected} argument")]
    WrongArgumentKind {
        expected: &'static str,
        builtin: &'static str,
    },

    #[error("missing required argument to `{0}`")]
    MissingArgument(&'static str),

    #[error("stack underflow evaluating expression")]
    StackUnderflow,

    #[error("jump target out of range")]
    BadJump,

    #[error(transparent)]
    BitReader(#[from] crate::bitreader::BitReaderError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("while evaluating expression at {path}: {source}")]
    Context {
        path: String,
        #[source]
        source: Box<EvalError>,
    },
}

/// Carries everything the VM needs to resolve a lookup: the tree built so
/// far, the node the evaluation is contextually anchored to (`this`), and the
/// bit reader atoms finalize through.
pub struct EvalContext<'a, 'b> {
    pub forest: &'a mut Forest,
    pub reader: &'a mut BitReader<'b>,
    pub current: NodeId,
}

/// Top-level entry point: runs `program` and finalizes its final result, then
/// wraps any error with the current node's path for diagnostics.
pub fn evaluate(program: &Program, ctx: &mut EvalContext) -> Result<Value, EvalError> {
    let path = ctx.forest.build_path(ctx.current);
    eval(program, ctx).map_err(|source| EvalError::Context {
        path,
        source: Box::new(source),
    })
}

/// Like [`evaluate`] but does not attach path context (used internally when
/// a caller is about to attach its own, e.g. nested in a builtin call).
pub fn eval(program: &Program, ctx: &mut EvalContext) -> Result<Value, EvalError> {
    let raw = run(program, ctx)?;
    finalize(raw, ctx)
}

/// Executes the bytecode and returns whatever ends up on the stack, without
/// finalizing. Used directly by `Op::AddressOf` and by builtins that want a
/// raw branch.
pub fn run(program: &Program, ctx: &mut EvalContext) -> Result<Value, EvalError> {
    let mut stack: Vec<Value> = Vec::new();
    let mut pc = 0usize;

    while pc < program.len() {
        match &program[pc] {
            Op::Const(c) => stack.push(match c {
                Const::Number(n) => Value::Number(*n),
                Const::Str(s) => Value::Str(s.to_string()),
                Const::Bool(b) => Value::Bool(*b),
            }),
            Op::LoadThis => stack.push(Value::Branch(ctx.current)),
            Op::LoadMain => stack.push(Value::Branch(ctx.forest.root())),
            Op::LoadName(name) => stack.push(Value::Branch(lookup_name(name, ctx)?)),
            Op::GetField(name) => {
                let base = pop(&mut stack)?;
                stack.push(Value::Branch(get_field(base, name, ctx)?));
            }
            Op::Index => {
                let index = pop(&mut stack)?;
                let base = pop(&mut stack)?;
                stack.push(Value::Branch(index_into(base, index, ctx)?));
            }
            Op::AddressOf(sub) => {
                stack.push(run(sub, ctx)?);
            }
            Op::Neg => {
                let v = finalize(pop(&mut stack)?, ctx)?;
                let n = as_number(&v, "-")?;
                stack.push(Value::Number(-n));
            }
            Op::Not => {
                let v = finalize(pop(&mut stack)?, ctx)?;
                let b = as_bool(&v, "!")?;
                stack.push(Value::Bool(!b));
            }
            Op::Arith(op) => {
                let rhs = finalize(pop(&mut stack)?, ctx)?;
                let lhs = finalize(pop(&mut stack)?, ctx)?;
                let a = as_number(&lhs, "arithmetic")?;
                let b = as_number(&rhs, "arithmetic")?;
                stack.push(Value::Number(match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Div => a / b,
                    ArithOp::Mod => a % b,
                }));
            }
            Op::Compare(op) => {
                let rhs = finalize(pop(&mut stack)?, ctx)?;
                let lhs = finalize(pop(&mut stack)?, ctx)?;
                stack.push(Value::Bool(compare(&lhs, &rhs, *op)?));
            }
            Op::And(rhs_program) => {
                let lhs = finalize(pop(&mut stack)?, ctx)?;
                let result = if as_bool(&lhs, "&&")? {
                    as_bool(&eval(rhs_program, ctx)?, "&&")?
                } else {
                    false
                };
                stack.push(Value::Bool(result));
            }
            Op::Or(rhs_program) => {
                let lhs = finalize(pop(&mut stack)?, ctx)?;
                let result = if as_bool(&lhs, "||")? {
                    true
                } else {
                    as_bool(&eval(rhs_program, ctx)?, "||")?
                };
                stack.push(Value::Bool(result));
            }
            Op::JumpIfFalsy(target) => {
                let v = finalize(pop(&mut stack)?, ctx)?;
                if !as_bool(&v, "condition")? {
                    pc = *target;
                    continue;
                }
            }
            Op::Jump(target) => {
                pc = *target;
                continue;
            }
            Op::Pop => {
                pop(&mut stack)?;
            }
            Op::Call(builtin, argc) => {
                let mut args = Vec::with_capacity(*argc as usize);
                for _ in 0..*argc {
                    args.push(pop(&mut stack)?);
                }
                args.reverse();
                stack.push(builtins::call(*builtin, args, ctx)?);
            }
        }
        pc += 1;
    }

    pop(&mut stack)
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, EvalError> {
    stack.pop().ok_or(EvalError::StackUnderflow)
}

fn as_number(v: &Value, op: &'static str) -> Result<f64, EvalError> {
    v.as_number().ok_or(EvalError::WrongArgumentKind {
        expected: "number",
        builtin: op,
    })
}

fn as_bool(v: &Value, op: &'static str) -> Result<bool, EvalError> {
    v.truthy().ok_or(EvalError::WrongArgumentKind {
        expected: "boolean",
        builtin: op,
    })
}

fn compare(lhs: &Value, rhs: &Value, op: CompareOp) -> Result<bool, EvalError> {
    use std::cmp::Ordering;
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Position(a), Value::Position(b)) => Some(a.cmp(b)),
        _ => {
            return Err(EvalError::WrongArgumentKind {
                expected: "comparable operands of matching type",
                builtin: "comparison",
            })
        }
    };
    let ordering = ordering.ok_or(EvalError::WrongArgumentKind {
        expected: "comparable operands",
        builtin: "comparison",
    })?;
    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    })
}

/// Resolves an identifier by searching upward: the current node's own
/// children first, then each ancestor's direct children in turn, up to and
/// including the root.
fn lookup_name(name: &str, ctx: &EvalContext) -> Result<NodeId, EvalError> {
    if name == "main" {
        return Ok(ctx.forest.root());
    }
    if name == "this" {
        return Ok(ctx.current);
    }

    let mut scope = Some(ctx.current);
    while let Some(node) = scope {
        for &child in ctx.forest.children(node) {
            if ctx.forest.get(child).name == name {
                return Ok(child);
            }
        }
        scope = ctx.forest.parent(node);
    }
    Err(EvalError::UnknownIdentifier(name.to_string()))
}

fn get_field(base: Value, name: &str, ctx: &EvalContext) -> Result<NodeId, EvalError> {
    let Value::Branch(id) = base else {
        return Err(EvalError::WrongArgumentKind {
            expected: "branch",
            builtin: ".",
        });
    };
    ctx.forest
        .children(id)
        .iter()
        .copied()
        .find(|&c| ctx.forest.get(c).name == name)
        .ok_or_else(|| EvalError::SubfieldNotFound {
            parent: ctx.forest.build_path(id),
            name: name.to_string(),
        })
}

fn index_into(base: Value, index: Value, ctx: &mut EvalContext) -> Result<NodeId, EvalError> {
    let Value::Branch(id) = base else {
        return Err(EvalError::WrongArgumentKind {
            expected: "branch",
            builtin: "[]",
        });
    };
    let index = finalize(index, ctx)?;
    let i = as_number(&index, "[]")? as i64;
    let children = ctx.forest.children(id);
    if i < 0 || i as usize >= children.len() {
        return Err(EvalError::IndexOutOfRange {
            index: i,
            len: children.len(),
        });
    }
    Ok(children[i as usize])
}

/// Finalizes a value: structs and array-roots pass through unchanged, atoms
/// are read and decoded (bumping `use_count`), consts/slots evaluate once and
/// cache. Everything else (numbers, strings, booleans, positions) is already
/// final.
pub fn finalize(value: Value, ctx: &mut EvalContext) -> Result<Value, EvalError> {
    let Value::Branch(id) = value else {
        return Ok(value);
    };

    let flags = ctx.forest.get(id).flags;
    if flags.is_struct || flags.is_array_root {
        return Ok(Value::Branch(id));
    }

    if flags.is_atom {
        let bit_count = ctx.forest.effective_bit_count(id);
        let base_type = ctx
            .forest
            .effective_base_type(id)
            .unwrap_or(AtomBaseType::Unsigned);
        let big_endian = ctx.forest.effective_big_endian(id);
        let location = ctx.forest.get(id).location;

        let mark = ctx.reader.mark();
        ctx.reader.seek(location);
        let raw = ctx.reader.read_bits(bit_count)?;
        ctx.reader.restore(mark);

        let endianness = if big_endian {
            Endianness::Big
        } else {
            Endianness::Little
        };
        let scalar = decode(raw, bit_count, base_type, endianness)?;
        ctx.forest.get_mut(id).use_count += 1;
        return Ok(scalar_to_value(scalar));
    }

    if flags.is_const || flags.is_slot {
        if ctx.forest.get(id).evaluated {
            return Ok(ctx.forest.get(id).evaluated_value.clone().unwrap());
        }
        let program = ctx
            .forest
            .get(id)
            .expression
            .clone()
            .ok_or(EvalError::MissingArgument("const/slot expression"))?;

        let saved = ctx.current;
        ctx.current = id;
        let value = eval(&program, ctx)?;
        ctx.current = saved;

        ctx.forest.get_mut(id).evaluated = true;
        ctx.forest.get_mut(id).evaluated_value = Some(value.clone());
        return Ok(value);
    }

    Ok(Value::Branch(id))
}

fn scalar_to_value(scalar: crate::value::Scalar) -> Value {
    Value::Number(scalar.as_f64())
}
