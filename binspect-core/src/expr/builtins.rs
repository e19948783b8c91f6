//! The built-in function table (`spec.md` §4.E).
//!
//! Functions split into two families: ones that want a raw branch
//! (`sizeof`, `startof`, `card`, ...) and ones that want a finalized scalar
//! (`byte`, `fcc`, `padd`, ...). Each handler finalizes its own arguments as
//! needed rather than the call site doing it uniformly, since which
//! arguments need finalizing differs per function.

use super::{finalize, EvalContext, EvalError, Value};
use crate::position::{Position, BIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    SizeOf,
    StartOf,
    EndOf,
    Byte,
    Peek,
    Card,
    Print,
    StrCat,
    SummaryOf,
    Str,
    Path,
    IndexOf,
    Fcc,
    PToI,
    IToP,
    PAdd,
    PSub,
    GTell,
}

impl std::fmt::Display for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Builtin::SizeOf => "sizeof",
            Builtin::StartOf => "startof",
            Builtin::EndOf => "endof",
            Builtin::Byte => "byte",
            Builtin::Peek => "peek",
            Builtin::Card => "card",
            Builtin::Print => "print",
            Builtin::StrCat => "strcat",
            Builtin::SummaryOf => "summaryof",
            Builtin::Str => "str",
            Builtin::Path => "path",
            Builtin::IndexOf => "indexof",
            Builtin::Fcc => "fcc",
            Builtin::PToI => "ptoi",
            Builtin::IToP => "itop",
            Builtin::PAdd => "padd",
            Builtin::PSub => "psub",
            Builtin::GTell => "gtell",
        };
        f.write_str(name)
    }
}

fn branch_arg(args: &[Value], i: usize, name: &'static str) -> Result<crate::forest::NodeId, EvalError> {
    match args.get(i) {
        Some(Value::Branch(id)) => Ok(*id),
        _ => Err(EvalError::WrongArgumentKind {
            expected: "branch (@path)",
            builtin: name,
        }),
    }
}

fn node_start(ctx: &EvalContext, id: crate::forest::NodeId) -> Position {
    let node = ctx.forest.get(id);
    if node.flags.is_struct || node.flags.is_array_root {
        node.start_offset
    } else {
        node.location
    }
}

fn node_end(ctx: &EvalContext, id: crate::forest::NodeId) -> Position {
    let node = ctx.forest.get(id);
    if node.flags.is_struct || node.flags.is_array_root {
        node.end_offset
    } else {
        let bit_count = ctx.forest.effective_bit_count(id);
        node.location + Position::from_bits(bit_count.max(1) as u64) - BIT
    }
}

pub fn call(builtin: Builtin, mut args: Vec<Value>, ctx: &mut EvalContext) -> Result<Value, EvalError> {
    match builtin {
        Builtin::SizeOf => {
            let a = branch_arg(&args, 0, "sizeof")?;
            let b = if args.len() > 1 {
                branch_arg(&args, 1, "sizeof")?
            } else {
                a
            };
            let start = node_start(ctx, a);
            let end = node_end(ctx, b);
            let span = (end - start) + crate::position::BYTE;
            Ok(Value::Number(span.bytes() as f64))
        }
        Builtin::StartOf => {
            let a = branch_arg(&args, 0, "startof")?;
            Ok(Value::Position(node_start(ctx, a)))
        }
        Builtin::EndOf => {
            let a = branch_arg(&args, 0, "endof")?;
            Ok(Value::Position(node_end(ctx, a)))
        }
        Builtin::Byte => {
            let off = finalize(args.remove(0), ctx)?;
            let n = number_arg(&off, "byte")?;
            ctx.reader.seek(Position::from_bytes(n as u64));
            let v = ctx.reader.read_bits(8)?;
            Ok(Value::Number(v as f64))
        }
        Builtin::Peek => {
            let n = if args.is_empty() {
                1u32
            } else {
                number_arg(&finalize(args.remove(0), ctx)?, "peek")? as u32
            };
            if n > 8 {
                return Err(EvalError::WrongArgumentKind {
                    expected: "<= 8 bytes",
                    builtin: "peek",
                });
            }
            let mark = ctx.reader.mark();
            let v = ctx.reader.read_bits(n * 8)?;
            ctx.reader.restore(mark);
            Ok(Value::Number(v as f64))
        }
        Builtin::Card => {
            let a = branch_arg(&args, 0, "card")?;
            let node = ctx.forest.get(a);
            if !node.flags.is_array_root {
                return Err(EvalError::WrongArgumentKind {
                    expected: "array-root branch",
                    builtin: "card",
                });
            }
            Ok(Value::Number(node.cardinal as f64))
        }
        Builtin::Print | Builtin::StrCat => {
            let mut out = String::new();
            for arg in args {
                let v = finalize(arg, ctx)?;
                out.push_str(&display(&v));
            }
            Ok(Value::Str(out))
        }
        Builtin::SummaryOf => {
            let a = branch_arg(&args, 0, "summaryof")?;
            Ok(Value::Str(ctx.forest.get(a).summary.clone().unwrap_or_default()))
        }
        Builtin::Str => {
            let a = branch_arg(&args, 0, "str")?;
            let node = ctx.forest.get(a);
            let bit_count = ctx.forest.effective_bit_count(a);
            if bit_count % 8 != 0 {
                return Err(EvalError::WrongArgumentKind {
                    expected: "byte-aligned atom",
                    builtin: "str",
                });
            }
            let big_endian = ctx.forest.effective_big_endian(a);
            let is_array = node.flags.is_array_root;
            let location = node_start(ctx, a);

            let mark = ctx.reader.mark();
            ctx.reader.seek(location);
            let mut bytes = Vec::with_capacity((bit_count / 8) as usize);
            for _ in 0..(bit_count / 8) {
                bytes.push(ctx.reader.read_bits(8)? as u8);
            }
            ctx.reader.restore(mark);

            // Strip the trailing terminator from the raw, as-read buffer
            // before any endianness reversal, matching the original.
            if bytes.last() == Some(&0) {
                bytes.pop();
            }
            if !big_endian && !is_array {
                bytes.reverse();
            }
            Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Builtin::Path => {
            let id = if args.is_empty() {
                ctx.current
            } else {
                branch_arg(&args, 0, "path")?
            };
            Ok(Value::Str(ctx.forest.build_path(id)))
        }
        Builtin::IndexOf => {
            let id = if args.is_empty() {
                ctx.current
            } else {
                branch_arg(&args, 0, "indexof")?
            };
            let node = ctx.forest.get(id);
            if !node.flags.is_array_element {
                return Err(EvalError::WrongArgumentKind {
                    expected: "array-element branch",
                    builtin: "indexof",
                });
            }
            Ok(Value::Number(node.cardinal as f64))
        }
        Builtin::Fcc => {
            let s = finalize(args.remove(0), ctx)?;
            let Value::Str(s) = s else {
                return Err(EvalError::WrongArgumentKind {
                    expected: "4-character string",
                    builtin: "fcc",
                });
            };
            let bytes = s.as_bytes();
            if bytes.len() != 4 {
                return Err(EvalError::WrongArgumentKind {
                    expected: "exactly 4 characters",
                    builtin: "fcc",
                });
            }
            let packed = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Ok(Value::Number(packed as f64))
        }
        Builtin::PToI => {
            let v = finalize(args.remove(0), ctx)?;
            let Value::Position(p) = v else {
                return Err(EvalError::WrongArgumentKind {
                    expected: "position",
                    builtin: "ptoi",
                });
            };
            Ok(Value::Number(p.bytes() as f64))
        }
        Builtin::IToP => {
            let v = finalize(args.remove(0), ctx)?;
            let n = number_arg(&v, "itop")?;
            Ok(Value::Position(Position::from_bytes(n as u64)))
        }
        Builtin::PAdd => {
            let mut total = Position::default();
            for arg in args {
                total += position_arg(finalize(arg, ctx)?, "padd")?;
            }
            Ok(Value::Position(total))
        }
        Builtin::PSub => {
            let a = position_arg(finalize(args.remove(0), ctx)?, "psub")?;
            let b = position_arg(finalize(args.remove(0), ctx)?, "psub")?;
            Ok(Value::Position(a - b))
        }
        Builtin::GTell => Ok(Value::Position(ctx.reader.tell())),
    }
}

fn number_arg(v: &Value, builtin: &'static str) -> Result<f64, EvalError> {
    v.as_number().ok_or(EvalError::WrongArgumentKind {
        expected: "number",
        builtin,
    })
}

fn position_arg(v: Value, builtin: &'static str) -> Result<Position, EvalError> {
    match v {
        Value::Position(p) => Ok(p),
        Value::Number(n) => Ok(Position::from_bytes(n as u64)),
        _ => Err(EvalError::WrongArgumentKind {
            expected: "position or number",
            builtin,
        }),
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Str(s) => s.clone(),
        Value::Position(p) => p.to_string(),
        Value::Branch(_) => String::from("<branch>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitreader::BitReader;
    use crate::forest::Forest;
    use crate::value::AtomBaseType;

    #[test]
    fn sizeof_spans_start_to_end_inclusive() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        {
            let node = forest.get_mut(root);
            node.start_offset = Position::from_bytes(0);
            node.end_offset = Position::from_bytes(3);
        }
        let data = [0u8; 4];
        let mut reader = BitReader::new(&data);
        let mut ctx = EvalContext {
            forest: &mut forest,
            reader: &mut reader,
            current: root,
        };
        let v = call(Builtin::SizeOf, vec![Value::Branch(root)], &mut ctx).unwrap();
        assert_eq!(v, Value::Number(4.0));
    }

    #[test]
    fn fcc_packs_big_endian() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let data = [0u8; 1];
        let mut reader = BitReader::new(&data);
        let mut ctx = EvalContext {
            forest: &mut forest,
            reader: &mut reader,
            current: root,
        };
        let v = call(Builtin::Fcc, vec![Value::Str("RIFF".into())], &mut ctx).unwrap();
        assert_eq!(v, Value::Number(u32::from_be_bytes(*b"RIFF") as f64));
    }

    #[test]
    fn card_requires_array_root() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let data = [0u8; 1];
        let mut reader = BitReader::new(&data);
        let mut ctx = EvalContext {
            forest: &mut forest,
            reader: &mut reader,
            current: root,
        };
        let err = call(Builtin::Card, vec![Value::Branch(root)], &mut ctx).unwrap_err();
        assert!(matches!(err, EvalError::WrongArgumentKind { .. }));
    }

    #[test]
    fn str_strips_trailing_nul() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let atom = forest.insert_child(root, "s");
        {
            let node = forest.get_mut(atom);
            node.flags.is_atom = true;
            node.bit_count = 32;
            node.base_type = Some(AtomBaseType::Unsigned);
            node.big_endian = true;
            node.location = Position::from_bytes(0);
        }
        let data = *b"hi\0\0";
        let mut reader = BitReader::new(&data);
        let mut ctx = EvalContext {
            forest: &mut forest,
            reader: &mut reader,
            current: root,
        };
        let v = call(Builtin::Str, vec![Value::Branch(atom)], &mut ctx).unwrap();
        assert_eq!(v, Value::Str("hi\0".to_string()));
    }

    #[test]
    fn str_strips_before_reversing_little_endian() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let atom = forest.insert_child(root, "s");
        {
            let node = forest.get_mut(atom);
            node.flags.is_atom = true;
            node.bit_count = 24;
            node.base_type = Some(AtomBaseType::Unsigned);
            node.big_endian = false;
            node.location = Position::from_bytes(0);
        }
        // Raw file bytes; the trailing raw byte is 0x41, not 0, so the
        // terminator check (on the raw buffer) must NOT strip it. Only
        // after that does little-endian reversal run.
        let data = [0x00u8, 0x42, 0x41];
        let mut reader = BitReader::new(&data);
        let mut ctx = EvalContext {
            forest: &mut forest,
            reader: &mut reader,
            current: root,
        };
        let v = call(Builtin::Str, vec![Value::Branch(atom)], &mut ctx).unwrap();
        assert_eq!(v, Value::Str("AB\0".to_string()));
    }

    #[test]
    fn str_uses_array_root_span_not_location() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let array = forest.insert_child(root, "payload");
        {
            let node = forest.get_mut(array);
            node.flags.is_array_root = true;
            node.bit_count = 32;
            node.base_type = Some(AtomBaseType::Unsigned);
            node.big_endian = true;
            // location is never set for array roots; only the span is.
            node.start_offset = Position::from_bytes(2);
            node.end_offset = Position::from_bytes(5);
        }
        let data = [0xffu8, 0xff, b'h', b'i', 0, 0];
        let mut reader = BitReader::new(&data);
        let mut ctx = EvalContext {
            forest: &mut forest,
            reader: &mut reader,
            current: root,
        };
        let v = call(Builtin::Str, vec![Value::Branch(array)], &mut ctx).unwrap();
        assert_eq!(v, Value::Str("hi\0".to_string()));
    }
}
