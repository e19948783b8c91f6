//! The analyzer: walks a structure's field declarations against binary bytes,
//! building the inspection forest.
//!
//! This is a recursive-descent interpreter over [`FieldDecl`]s rather than a
//! single state machine: each nested structure, conditional body, sentry
//! scope and enumerated option gets its own call frame, and Rust's ordinary
//! call stack does the job the original did with explicit RAII scope guards.
//! Only state genuinely shared across a structure body — the typedef map
//! currently in scope, the last conditional's value, the active sentry bound
//! — needs explicit threading.

use crate::ast::{
    AstError, AtomField, Conditional, FieldDecl, FieldKind, ResolvedTypedef, SizeType,
    StructField, StructureMap, TypedefMap,
};
use crate::bitreader::{BitReader, BitReaderError};
use crate::expr::{EvalContext, EvalError, Program, Value};
use crate::forest::{Forest, NodeId};
use crate::position::Position;
use crate::value::ValueError;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerOptions {
    pub quiet: bool,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        AnalyzerOptions { quiet: false }
    }
}

impl AnalyzerOptions {
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Ast(#[from] AstError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    BitReader(#[from] BitReaderError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("invariant `{0}` failed")]
    InvariantFailed(String),

    #[error("{0}")]
    Die(String),

    #[error("enumerated value did not match any option and no default was given, at {0}")]
    EnumeratedNoMatch(String),

    #[error("terminator size is not supported on struct arrays")]
    TerminatorOnStruct,

    #[error("terminator arrays require a byte-aligned atom width of 1, 2, 4 or 8 bytes, got {0} bits")]
    UnsupportedTerminatorWidth(u32),

    #[error("a second end-of-file was reached after the `eof` slot already fired")]
    SecondEof,
}

struct Walker<'data, 'out> {
    structures: &'data StructureMap,
    forest: Forest,
    reader: BitReader<'data>,
    out: &'out mut dyn Write,
    options: AnalyzerOptions,
    eof_fired: bool,
    sentries: Vec<Position>,
}

/// Entry point. Creates the synthetic `main` root node and walks
/// `starting_struct` under it.
pub fn analyze_binary(
    structures: &StructureMap,
    data: &[u8],
    starting_struct: &str,
    options: AnalyzerOptions,
    out: &mut dyn Write,
) -> Result<Forest, AnalysisError> {
    let mut walker = Walker {
        structures,
        forest: Forest::new(),
        reader: BitReader::new(data),
        out,
        options,
        eof_fired: false,
        sentries: Vec::new(),
    };

    let root = walker.forest.set_root("main", starting_struct);
    let fields = walker.structures.structure_for(starting_struct)?.to_vec();
    let mut typedefs = TypedefMap::new();
    walker.walk_fields(root, &fields, &mut typedefs)?;
    Ok(walker.forest)
}

impl<'data, 'out> Walker<'data, 'out> {
    fn eval(&mut self, current: NodeId, program: &Program) -> Result<Value, AnalysisError> {
        let mut ctx = EvalContext {
            forest: &mut self.forest,
            reader: &mut self.reader,
            current,
        };
        Ok(crate::expr::evaluate(program, &mut ctx)?)
    }

    fn eval_branch(&mut self, current: NodeId, program: &Program) -> Result<NodeId, AnalysisError> {
        let mut ctx = EvalContext {
            forest: &mut self.forest,
            reader: &mut self.reader,
            current,
        };
        match crate::expr::run(program, &mut ctx)? {
            Value::Branch(id) => Ok(id),
            _ => Err(EvalError::WrongArgumentKind {
                expected: "branch (@path)",
                builtin: "enumerate/signal",
            }
            .into()),
        }
    }

    fn eval_number(&mut self, current: NodeId, program: &Program) -> Result<f64, AnalysisError> {
        match self.eval(current, program)? {
            Value::Number(n) => Ok(n),
            _ => Err(EvalError::WrongArgumentKind {
                expected: "number",
                builtin: "size/bit-count expression",
            }
            .into()),
        }
    }

    fn eval_bool(&mut self, current: NodeId, program: &Program) -> Result<bool, AnalysisError> {
        match self.eval(current, program)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => Ok(n != 0.0),
            _ => Err(EvalError::WrongArgumentKind {
                expected: "boolean",
                builtin: "condition",
            }
            .into()),
        }
    }

    fn walk_fields(
        &mut self,
        parent: NodeId,
        fields: &[FieldDecl],
        typedefs: &mut TypedefMap,
    ) -> Result<(), AnalysisError> {
        let mut last_conditional: Option<bool> = None;
        for field in fields {
            self.walk_field(parent, field, typedefs, &mut last_conditional)?;
        }
        Ok(())
    }

    fn walk_field(
        &mut self,
        parent: NodeId,
        field: &FieldDecl,
        typedefs: &mut TypedefMap,
        last_conditional: &mut Option<bool>,
    ) -> Result<(), AnalysisError> {
        let guard = match field.conditional {
            Some(Conditional::If) => {
                let value = self.eval_bool(parent, field.if_expression.as_ref().expect("if without guard"))?;
                *last_conditional = Some(value);
                value
            }
            Some(Conditional::Else) => !last_conditional.unwrap_or(true),
            None => true,
        };
        if !guard {
            return Ok(());
        }

        match &field.kind {
            FieldKind::TypedefAtom {
                type_name,
                base_type,
                bit_count_expression,
                is_big_endian_expression,
            } => {
                typedefs.install_atom(
                    type_name.clone(),
                    *base_type,
                    bit_count_expression.clone(),
                    is_big_endian_expression.clone(),
                );
                Ok(())
            }
            FieldKind::TypedefNamed { type_name, target } => {
                typedefs.install_named(type_name.clone(), target.clone());
                Ok(())
            }
            FieldKind::Named { type_name } => match typedefs.resolve(type_name) {
                ResolvedTypedef::Atom {
                    base_type,
                    bit_count_expression,
                    is_big_endian_expression,
                } => {
                    let af = AtomField {
                        base_type,
                        bit_count_expression,
                        is_big_endian_expression,
                        invariant_expression: None,
                    };
                    self.walk_atom_decl(parent, field, &af, typedefs)
                }
                ResolvedTypedef::Struct { struct_name } => {
                    let sf = StructField { struct_name };
                    self.walk_struct_decl(parent, field, &sf, typedefs)
                }
            },
            FieldKind::Struct(sf) => self.walk_struct_decl(parent, field, sf, typedefs),
            FieldKind::Atom(af) => self.walk_atom_decl(parent, field, af, typedefs),
            FieldKind::Const(cf) => {
                let child = self.forest.insert_child(parent, field.name.clone());
                let now = self.reader.tell();
                {
                    let node = self.forest.get_mut(child);
                    node.flags.is_const = true;
                    node.expression = Some(cf.expression.clone());
                }
                self.forest.extend_span(parent, now, now);
                Ok(())
            }
            FieldKind::Slot { expression } => {
                let child = self.forest.insert_child(parent, field.name.clone());
                let now = self.reader.tell();
                {
                    let node = self.forest.get_mut(child);
                    node.flags.is_slot = true;
                    node.expression = Some(expression.clone());
                }
                self.forest.extend_span(parent, now, now);
                Ok(())
            }
            FieldKind::Signal { expression } => {
                if let Some(slot) = self.find_named_ancestor_scope(parent, &field.name) {
                    let node = self.forest.get_mut(slot);
                    node.expression = Some(expression.clone());
                    node.evaluated = false;
                    node.evaluated_value = None;
                }
                Ok(())
            }
            FieldKind::Skip { expression } => {
                let n = self.eval_number(parent, expression)? as u64;
                let start = self.reader.tell();
                match self.reader.advance(Position::from_bytes(n)) {
                    Ok(()) => {
                        let end = self.reader.tell();
                        let child = self.forest.insert_child(parent, field.name.clone());
                        {
                            let node = self.forest.get_mut(child);
                            node.flags.is_skip = true;
                            node.location = start;
                            node.bit_count = (n * 8) as u32;
                        }
                        self.forest.extend_span(parent, start, end);
                        Ok(())
                    }
                    Err(e) => self.eof_or_fatal(None, e.into()),
                }
            }
            FieldKind::Invariant { expression } => {
                if self.eval_bool(parent, expression)? {
                    Ok(())
                } else {
                    Err(AnalysisError::InvariantFailed(field.name.clone()))
                }
            }
            FieldKind::Notify { args } => {
                if !self.options.quiet {
                    let msg = self.render_args(parent, args)?;
                    let _ = writeln!(self.out, "{}", msg);
                }
                Ok(())
            }
            FieldKind::Summary { args } => {
                if !self.options.quiet {
                    let msg = self.render_args(parent, args)?;
                    let _ = writeln!(self.out, "{}", msg);
                }
                Ok(())
            }
            FieldKind::Die { args } => {
                let msg = self.render_args(parent, args)?;
                let _ = writeln!(self.out, "{}", msg);
                Err(AnalysisError::Die(msg))
            }
            FieldKind::Sentry { expression, body } => self.walk_sentry(parent, expression, body, typedefs),
            FieldKind::Enumerated(ef) => self.walk_enumerated(parent, &ef.expression, &ef.body, typedefs),
            FieldKind::EnumeratedOption(_) | FieldKind::EnumeratedDefault { .. } => {
                unreachable!("enumerated option/default only dispatched from walk_enumerated")
            }
        }
    }

    fn render_args(&mut self, current: NodeId, args: &[Program]) -> Result<String, AnalysisError> {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.eval(current, arg)?;
            parts.push(match v {
                Value::Str(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Position(p) => p.to_string(),
                Value::Branch(id) => self.forest.build_path(id),
            });
        }
        Ok(parts.join(" "))
    }

    fn find_named_ancestor_scope(&self, start: NodeId, name: &str) -> Option<NodeId> {
        let mut scope = Some(start);
        while let Some(node) = scope {
            for &child in self.forest.children(node) {
                if self.forest.get(child).name == name {
                    return Some(child);
                }
            }
            scope = self.forest.parent(node);
        }
        None
    }

    /// Records that the read at `maybe_node` (if any node was created before
    /// the failing read) hit end of file: detaches the node, and fires the
    /// `eof` slot the first time this happens. A second EOF is fatal.
    fn note_eof_and_detach(&mut self, maybe_node: Option<NodeId>) -> Result<(), AnalysisError> {
        if let Some(id) = maybe_node {
            self.forest.detach(id);
        }
        if self.eof_fired {
            return Err(AnalysisError::SecondEof);
        }
        self.eof_fired = true;
        self.fire_eof_slot();
        Ok(())
    }

    /// If `err` is an EOF, handles it via [`Self::note_eof_and_detach`] and
    /// returns `Ok(())`; any other error propagates unchanged.
    fn eof_or_fatal(&mut self, maybe_node: Option<NodeId>, err: AnalysisError) -> Result<(), AnalysisError> {
        if matches!(err, AnalysisError::BitReader(BitReaderError::Eof(_))) {
            self.note_eof_and_detach(maybe_node)
        } else {
            Err(err)
        }
    }

    fn fire_eof_slot(&mut self) {
        let root = self.forest.root();
        if let Some(&id) = self
            .forest
            .preorder(root)
            .iter()
            .find(|&&id| self.forest.get(id).flags.is_slot && self.forest.get(id).name == "eof")
        {
            let node = self.forest.get_mut(id);
            node.evaluated = true;
            node.evaluated_value = Some(Value::Bool(true));
        }
    }

    fn check_sentry(&mut self, end: Position) {
        if let Some(&limit) = self.sentries.last() {
            if end > limit {
                let _ = writeln!(self.out, "sentry breach: read to {} past bound {}", end, limit);
            }
        }
    }

    fn walk_sentry(
        &mut self,
        parent: NodeId,
        expression: &Program,
        body: &[FieldDecl],
        typedefs: &mut TypedefMap,
    ) -> Result<(), AnalysisError> {
        let limit = match self.eval(parent, expression)? {
            Value::Position(p) => p,
            Value::Number(n) => self.reader.tell() + Position::from_bytes(n as u64),
            _ => {
                return Err(EvalError::WrongArgumentKind {
                    expected: "number or position",
                    builtin: "sentry",
                }
                .into())
            }
        };

        self.sentries.push(limit);
        let mut scoped_typedefs = typedefs.clone();
        let result = self.walk_fields(parent, body, &mut scoped_typedefs);
        self.sentries.pop();
        result?;

        let now = self.reader.tell();
        if now != limit {
            let _ = writeln!(self.out, "sentry undershoot/overshoot: at {}, expected {}", now, limit);
        }
        Ok(())
    }

    fn walk_enumerated(
        &mut self,
        parent: NodeId,
        expression: &Program,
        body: &[FieldDecl],
        typedefs: &mut TypedefMap,
    ) -> Result<(), AnalysisError> {
        let atom_id = self.eval_branch(parent, expression)?;
        let value = match crate::expr::finalize(
            Value::Branch(atom_id),
            &mut EvalContext {
                forest: &mut self.forest,
                reader: &mut self.reader,
                current: parent,
            },
        )? {
            Value::Number(n) => n,
            _ => {
                return Err(EvalError::WrongArgumentKind {
                    expected: "number",
                    builtin: "enumerate",
                }
                .into())
            }
        };

        let mut option_set = crate::forest::OptionSet::default();
        let mut found = false;

        for option in body {
            match &option.kind {
                FieldKind::EnumeratedOption(opt) => {
                    let option_value = self.eval_number(parent, &opt.expression)?;
                    option_set.insert(option_value);
                    if !found && option_value == value {
                        found = true;
                        self.walk_fields(parent, &opt.body, typedefs)?;
                    }
                }
                FieldKind::EnumeratedDefault { body: default_body } => {
                    if !found {
                        self.walk_fields(parent, default_body, typedefs)?;
                        found = true;
                    }
                }
                _ => {
                    let mut no_chain = None;
                    self.walk_field(parent, option, typedefs, &mut no_chain)?;
                }
            }
        }

        if let Some(existing) = &self.forest.get(atom_id).option_set {
            if !existing.is_empty() {
                let _ = writeln!(self.out, "atom `{}` already had an option set", self.forest.build_path(atom_id));
            }
        }
        self.forest.get_mut(atom_id).option_set = Some(option_set);

        if !found {
            return Err(AnalysisError::EnumeratedNoMatch(self.forest.build_path(parent)));
        }
        Ok(())
    }

    // -- struct declarations --------------------------------------------

    fn walk_struct_decl(
        &mut self,
        parent: NodeId,
        field: &FieldDecl,
        sf: &StructField,
        typedefs: &mut TypedefMap,
    ) -> Result<(), AnalysisError> {
        if field.conditional.is_some() {
            // Flattened: fields of the referenced structure become direct
            // continuations of `parent`, with no wrapper node.
            let fields = self.structures.structure_for(&sf.struct_name)?.to_vec();
            let mut scoped = typedefs.clone();
            return self.walk_fields(parent, &fields, &mut scoped);
        }

        self.with_offset(parent, field, |this| match field.size.size_type {
            SizeType::None => {
                this.create_struct_element(parent, &field.name, &sf.struct_name, typedefs, None)?;
                Ok(())
            }
            SizeType::Terminator => Err(AnalysisError::TerminatorOnStruct),
            SizeType::Integer => {
                let n = this.eval_number(parent, field.size.expression.as_ref().unwrap())? as u64;
                let root = this.new_array_root(parent, field);
                for i in 0..n {
                    if !this.create_struct_element(root, &field.name, &sf.struct_name, typedefs, Some(i))? {
                        break;
                    }
                }
                this.forest.get_mut(root).cardinal = this.forest.children(root).len() as u64;
                Ok(())
            }
            SizeType::While => {
                let root = this.new_array_root(parent, field);
                let mut i = 0u64;
                while this.eval_bool(root, field.size.expression.as_ref().unwrap())? {
                    if !this.create_struct_element(root, &field.name, &sf.struct_name, typedefs, Some(i))? {
                        break;
                    }
                    i += 1;
                }
                this.forest.get_mut(root).cardinal = this.forest.children(root).len() as u64;
                Ok(())
            }
            SizeType::Delimiter => {
                let v = this.eval_number(parent, field.size.expression.as_ref().unwrap())? as u64;
                let width = delimiter_byte_width(v);
                let root = this.new_array_root(parent, field);
                let mut i = 0u64;
                loop {
                    if this.peek_matches(width, v)? {
                        break;
                    }
                    if !this.create_struct_element(root, &field.name, &sf.struct_name, typedefs, Some(i))? {
                        break;
                    }
                    i += 1;
                }
                this.forest.get_mut(root).cardinal = this.forest.children(root).len() as u64;
                Ok(())
            }
        })
    }

    /// Creates one struct element (or the lone instance, if `index` is
    /// `None`). Returns `Ok(false)` if the read hit EOF (handled, array
    /// should stop), `Ok(true)` on a normal element.
    fn create_struct_element(
        &mut self,
        parent: NodeId,
        name: &str,
        struct_name: &str,
        typedefs: &TypedefMap,
        index: Option<u64>,
    ) -> Result<bool, AnalysisError> {
        let child = self.forest.insert_child(parent, name.to_string());
        {
            let node = self.forest.get_mut(child);
            node.flags.is_struct = true;
            if index.is_none() {
                node.struct_name = Some(struct_name.to_string());
            } else {
                node.flags.is_array_element = true;
                node.cardinal = index.unwrap();
            }
        }

        let start = self.reader.tell();
        let fields = self.structures.structure_for(struct_name)?.to_vec();
        let mut scoped = typedefs.clone();
        let result = self.walk_fields(child, &fields, &mut scoped);
        let end = self.reader.tell();
        self.forest.extend_span(child, start, end);
        self.forest.extend_span(parent, start, end);
        self.check_sentry(end);

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                self.eof_or_fatal(Some(child), e)?;
                Ok(false)
            }
        }
    }

    fn new_array_root(&mut self, parent: NodeId, field: &FieldDecl) -> NodeId {
        let root = self.forest.insert_child(parent, field.name.clone());
        let node = self.forest.get_mut(root);
        node.flags.is_array_root = true;
        node.shuffle = field.shuffle;
        root
    }

    fn peek_matches(&mut self, width_bytes: u32, target: u64) -> Result<bool, AnalysisError> {
        let mark = self.reader.mark();
        let raw = self.reader.read_bits(width_bytes * 8);
        self.reader.restore(mark);
        match raw {
            Ok(v) => Ok(v == target),
            Err(BitReaderError::Eof(_)) => Ok(true), // no room left: stop the array
            Err(e) => Err(e.into()),
        }
    }

    // -- atom declarations ------------------------------------------------

    fn walk_atom_decl(
        &mut self,
        parent: NodeId,
        field: &FieldDecl,
        af: &AtomField,
        _typedefs: &mut TypedefMap,
    ) -> Result<(), AnalysisError> {
        let bit_count = self.eval_number(parent, &af.bit_count_expression)? as u32;
        let big_endian = self.eval_bool(parent, &af.is_big_endian_expression)?;
        validate_atom_width(af.base_type, bit_count)?;

        self.with_offset(parent, field, |this| match field.size.size_type {
            SizeType::None => {
                this.create_atom_element(parent, field, af, bit_count, big_endian, None)?;
                Ok(())
            }
            SizeType::Integer => {
                let n = this.eval_number(parent, field.size.expression.as_ref().unwrap())? as u64;
                let root = this.new_atom_array_root(parent, field, af, bit_count, big_endian);
                for i in 0..n {
                    if !this.create_atom_element(root, field, af, bit_count, big_endian, Some(i))? {
                        break;
                    }
                }
                this.forest.get_mut(root).cardinal = this.forest.children(root).len() as u64;
                Ok(())
            }
            SizeType::While => {
                let root = this.new_atom_array_root(parent, field, af, bit_count, big_endian);
                let mut i = 0u64;
                while this.eval_bool(root, field.size.expression.as_ref().unwrap())? {
                    if !this.create_atom_element(root, field, af, bit_count, big_endian, Some(i))? {
                        break;
                    }
                    i += 1;
                }
                this.forest.get_mut(root).cardinal = this.forest.children(root).len() as u64;
                Ok(())
            }
            SizeType::Terminator => {
                if bit_count % 8 != 0 || ![8u32, 16, 32, 64].contains(&bit_count) {
                    return Err(AnalysisError::UnsupportedTerminatorWidth(bit_count));
                }
                let target = this.eval_number(parent, field.size.expression.as_ref().unwrap())? as u64;
                let root = this.new_atom_array_root(parent, field, af, bit_count, big_endian);
                let mut i = 0u64;
                loop {
                    let start = this.reader.tell();
                    match this.reader.read_bits(bit_count) {
                        Ok(value) => {
                            let elem = this.forest.insert_child(root, field.name.clone());
                            {
                                let node = this.forest.get_mut(elem);
                                node.flags.is_atom = true;
                                node.flags.is_array_element = true;
                                node.cardinal = i;
                                node.location = start;
                            }
                            let end = this.reader.tell();
                            this.forest.extend_span(root, start, end);
                            this.forest.extend_span(parent, start, end);
                            this.check_sentry(end);
                            i += 1;
                            if value == target {
                                break;
                            }
                        }
                        Err(e) => {
                            this.eof_or_fatal(None, e.into())?;
                            break;
                        }
                    }
                }
                this.forest.get_mut(root).cardinal = i;
                Ok(())
            }
            SizeType::Delimiter => {
                let v = this.eval_number(parent, field.size.expression.as_ref().unwrap())? as u64;
                let width = delimiter_byte_width(v);
                let root = this.new_atom_array_root(parent, field, af, bit_count, big_endian);
                let mut i = 0u64;
                loop {
                    if this.peek_matches(width, v)? {
                        break;
                    }
                    if !this.create_atom_element(root, field, af, bit_count, big_endian, Some(i))? {
                        break;
                    }
                    i += 1;
                }
                this.forest.get_mut(root).cardinal = i;
                Ok(())
            }
        })
    }

    fn new_atom_array_root(
        &mut self,
        parent: NodeId,
        field: &FieldDecl,
        af: &AtomField,
        bit_count: u32,
        big_endian: bool,
    ) -> NodeId {
        let root = self.new_array_root(parent, field);
        let node = self.forest.get_mut(root);
        node.base_type = Some(af.base_type);
        node.big_endian = big_endian;
        node.bit_count = bit_count;
        root
    }

    /// Creates one atom element (or the lone instance, if `index` is
    /// `None`), advancing the reader past its bits. Returns `Ok(false)` if
    /// the advance hit EOF (handled, array should stop).
    fn create_atom_element(
        &mut self,
        parent: NodeId,
        field: &FieldDecl,
        af: &AtomField,
        bit_count: u32,
        big_endian: bool,
        index: Option<u64>,
    ) -> Result<bool, AnalysisError> {
        let start = self.reader.tell();
        if let Err(e) = self.reader.advance(Position::from_bits(bit_count as u64)) {
            self.eof_or_fatal(None, e.into())?;
            return Ok(false);
        }
        let end = self.reader.tell();

        let child = self.forest.insert_child(parent, field.name.clone());
        {
            let node = self.forest.get_mut(child);
            node.flags.is_atom = true;
            node.location = start;
            if index.is_none() {
                node.bit_count = bit_count;
                node.base_type = Some(af.base_type);
                node.big_endian = big_endian;
            } else {
                node.flags.is_array_element = true;
                node.cardinal = index.unwrap();
            }
        }

        self.forest.extend_span(parent, start, end);
        self.check_sentry(end);

        if let Some(invariant) = &af.invariant_expression {
            if !self.eval_bool(child, invariant)? {
                return Err(AnalysisError::InvariantFailed(field.name.clone()));
            }
        }

        Ok(true)
    }

    /// Applies an explicit `@offset` expression around field creation: seeks
    /// the reader there, runs `body`, then restores the original position so
    /// the parent's running offset cache stays correct.
    fn with_offset<F>(&mut self, parent: NodeId, field: &FieldDecl, body: F) -> Result<(), AnalysisError>
    where
        F: FnOnce(&mut Self) -> Result<(), AnalysisError>,
    {
        match &field.offset {
            None => body(self),
            Some(expr) => {
                let target = match self.eval(parent, expr)? {
                    Value::Position(p) => p,
                    Value::Number(n) => Position::from_bytes(n as u64),
                    _ => {
                        return Err(EvalError::WrongArgumentKind {
                            expected: "number or position",
                            builtin: "offset",
                        }
                        .into())
                    }
                };
                let saved = self.reader.tell();
                self.reader.seek(target);
                let result = body(self);
                self.reader.seek(saved);
                result
            }
        }
    }
}

fn validate_atom_width(base_type: crate::value::AtomBaseType, bit_count: u32) -> Result<(), AnalysisError> {
    if bit_count == 0 {
        return Err(ValueError::ZeroWidth.into());
    }
    if bit_count > 64 {
        return Err(ValueError::TooWide(bit_count).into());
    }
    if base_type == crate::value::AtomBaseType::Float && bit_count != 32 && bit_count != 64 {
        return Err(ValueError::InvalidFloatWidth(bit_count).into());
    }
    Ok(())
}

/// Number of bytes needed to hold `v`, i.e. the smallest `k` such that
/// `256^k > v` — the delimiter peek width (no user override; see
/// `DESIGN.md`).
fn delimiter_byte_width(v: u64) -> u32 {
    if v == 0 {
        1
    } else {
        let bits = 64 - v.leading_zeros();
        (bits + 7) / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ConstField, ParseInfo, SizeSpec};
    use std::sync::Arc;

    fn info() -> ParseInfo {
        ParseInfo {
            filename: "t.bsp".into(),
            line_number: 1,
        }
    }

    fn const_num(n: f64) -> Program {
        Arc::from(vec![crate::expr::Op::Const(crate::expr::Const::Number(n))])
    }

    fn const_bool(b: bool) -> Program {
        Arc::from(vec![crate::expr::Op::Const(crate::expr::Const::Bool(b))])
    }

    fn atom_field(name: &str, bits: f64, big_endian: bool) -> FieldDecl {
        FieldDecl {
            name: name.to_string(),
            conditional: None,
            if_expression: None,
            size: SizeSpec::NONE,
            shuffle: false,
            offset: None,
            kind: FieldKind::Atom(AtomField {
                base_type: crate::value::AtomBaseType::Unsigned,
                bit_count_expression: const_num(bits),
                is_big_endian_expression: const_bool(big_endian),
                invariant_expression: None,
            }),
            parse_info: info(),
        }
    }

    #[test]
    fn fixed_atom_scenario() {
        let mut structures = StructureMap::new();
        structures.define("main", vec![atom_field("x", 8.0, true)]).unwrap();
        let data = [0x2Au8];
        let mut out = Vec::new();
        let forest = analyze_binary(&structures, &data, "main", AnalyzerOptions::default(), &mut out).unwrap();
        let root = forest.root();
        let x = forest.children(root)[0];
        assert_eq!(forest.get(x).name, "x");
        assert_eq!(forest.get(x).use_count, 0);
    }

    #[test]
    fn endianness_scenario() {
        let mut structures = StructureMap::new();
        structures.define("main", vec![atom_field("x", 16.0, false)]).unwrap();
        let data = [0x34u8, 0x12];
        let mut out = Vec::new();
        let forest = analyze_binary(&structures, &data, "main", AnalyzerOptions::default(), &mut out).unwrap();
        let root = forest.root();
        let x = forest.children(root)[0];
        assert_eq!(forest.get(x).location, Position::from_bytes(0));
        assert_eq!(forest.get(x).bit_count, 16);
        assert!(!forest.get(x).big_endian);
    }

    #[test]
    fn sized_array_scenario() {
        let mut structures = StructureMap::new();
        let n_field = atom_field("n", 8.0, true);
        let mut data_field = atom_field("data", 8.0, true);
        data_field.size = SizeSpec {
            size_type: SizeType::Integer,
            expression: Some(Arc::from(vec![crate::expr::Op::LoadName(Arc::from("n"))])),
        };
        structures.define("main", vec![n_field, data_field]).unwrap();
        let data = [0x03u8, 0x41, 0x42, 0x43];
        let mut out = Vec::new();
        let forest = analyze_binary(&structures, &data, "main", AnalyzerOptions::default(), &mut out).unwrap();
        let root = forest.root();
        let arr = forest.children(root)[1];
        assert_eq!(forest.get(arr).cardinal, 3);
        assert_eq!(forest.children(arr).len(), 3);
        let n = forest.children(root)[0];
        assert!(forest.get(n).use_count >= 1);
    }

    #[test]
    fn invariant_success_and_failure() {
        let mut structures = StructureMap::new();
        let mut t_field = atom_field("t", 8.0, true);
        let invariant_expr: Program = Arc::from(vec![
            crate::expr::Op::LoadName(Arc::from("t")),
            crate::expr::Op::Const(crate::expr::Const::Number(7.0)),
            crate::expr::Op::Compare(crate::expr::CompareOp::Eq),
        ]);
        if let FieldKind::Atom(af) = &mut t_field.kind {
            af.invariant_expression = Some(invariant_expr);
        }
        structures.define("main", vec![t_field]).unwrap();

        let mut out = Vec::new();
        let ok = analyze_binary(&structures, &[7u8], "main", AnalyzerOptions::default(), &mut out);
        assert!(ok.is_ok());

        let mut out2 = Vec::new();
        let bad = analyze_binary(&structures, &[8u8], "main", AnalyzerOptions::default(), &mut out2);
        assert!(matches!(bad, Err(AnalysisError::InvariantFailed(_))));
    }

    #[test]
    fn const_is_deferred_until_first_use() {
        let mut structures = StructureMap::new();
        let const_field = FieldDecl {
            name: "c".to_string(),
            conditional: None,
            if_expression: None,
            size: SizeSpec::NONE,
            shuffle: false,
            offset: None,
            kind: FieldKind::Const(ConstField {
                expression: const_num(5.0),
                no_print: false,
            }),
            parse_info: info(),
        };
        structures.define("main", vec![const_field]).unwrap();
        let mut out = Vec::new();
        let forest = analyze_binary(&structures, &[], "main", AnalyzerOptions::default(), &mut out).unwrap();
        let root = forest.root();
        let c = forest.children(root)[0];
        assert!(!forest.get(c).evaluated);
    }

    #[test]
    fn eof_detaches_offending_node_and_fires_slot_once() {
        let mut structures = StructureMap::new();
        let eof_slot = FieldDecl {
            name: "eof".to_string(),
            conditional: None,
            if_expression: None,
            size: SizeSpec::NONE,
            shuffle: false,
            offset: None,
            kind: FieldKind::Slot {
                expression: const_bool(false),
            },
            parse_info: info(),
        };
        structures
            .define("main", vec![eof_slot, atom_field("too_big", 32.0, true)])
            .unwrap();
        let data = [0u8; 1];
        let mut out = Vec::new();
        let forest = analyze_binary(&structures, &data, "main", AnalyzerOptions::default(), &mut out).unwrap();
        let root = forest.root();
        let slot = forest.children(root)[0];
        assert!(forest.get(slot).evaluated);
        assert_eq!(forest.get(slot).evaluated_value, Some(Value::Bool(true)));
        assert_eq!(forest.children(root).len(), 1);
    }

    #[test]
    fn sentry_reports_undershoot() {
        let mut structures = StructureMap::new();
        let sentry = FieldDecl {
            name: "s".to_string(),
            conditional: None,
            if_expression: None,
            size: SizeSpec::NONE,
            shuffle: false,
            offset: None,
            kind: FieldKind::Sentry {
                expression: const_num(4.0),
                body: vec![atom_field("a", 8.0, true)],
            },
            parse_info: info(),
        };
        structures.define("main", vec![sentry]).unwrap();
        let data = [0u8; 8];
        let mut out = Vec::new();
        analyze_binary(&structures, &data, "main", AnalyzerOptions::default(), &mut out).unwrap();
        let logged = String::from_utf8(out).unwrap();
        assert!(logged.contains("undershoot"));
    }
}
