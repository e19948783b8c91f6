// main.rs
//!
//! A thin demonstration binary over `binspect-core`. The template-language
//! parser is out of scope (see `SPEC_FULL.md` §1), so this binary does not
//! read `.bsp` template files; instead it builds one small, fixed demo
//! schema in code and runs it against whatever input binary is given. Wiring
//! a real parser's `StructureMap` output in here is a drop-in replacement
//! for `demo_structures()`.

use anyhow::Context;
use argh::FromArgs;
use binspect_core::analyzer::{analyze_binary, AnalyzerOptions};
use binspect_core::ast::{AtomField, FieldDecl, FieldKind, ParseInfo, SizeSpec, SizeType, StructureMap};
use binspect_core::expr::{Const, Op};
use binspect_core::fuzz::{fuzz, FuzzOptions};
use binspect_core::value::AtomBaseType;
use indicatif::{ProgressBar, ProgressStyle};
use mimalloc::MiMalloc;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(FromArgs, PartialEq, Debug)]
/// Inspect and fuzz a binary file against the built-in demo schema.
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum Command {
    Analyze(AnalyzeArgs),
    Fuzz(FuzzArgs),
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "analyze")]
/// Walk a binary against the demo schema and print the resulting tree.
struct AnalyzeArgs {
    /// path to the binary file to analyze
    #[argh(positional)]
    input: PathBuf,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "fuzz")]
/// Analyze a binary, build its attack surface, and write mutated derivatives.
struct FuzzArgs {
    /// path to the binary file to fuzz
    #[argh(positional)]
    input: PathBuf,

    /// directory derivatives are written under (a `fuzzed/` subdirectory is created there)
    #[argh(positional)]
    output: PathBuf,

    /// use recursive (stochastic, chained) mode instead of flat mode
    #[argh(switch)]
    recurse: bool,

    /// hash derivative filenames instead of embedding the offset/base name
    #[argh(switch)]
    path_hash: bool,

    /// cap on the number of derivative files written
    #[argh(option, default = "10_000")]
    budget: usize,
}

fn const_num(n: f64) -> Arc<[Op]> {
    Arc::from(vec![Op::Const(Const::Number(n))])
}

fn const_bool(b: bool) -> Arc<[Op]> {
    Arc::from(vec![Op::Const(Const::Bool(b))])
}

fn parse_info() -> ParseInfo {
    ParseInfo {
        filename: "<builtin demo schema>".to_string(),
        line_number: 0,
    }
}

fn atom_field(name: &str, bit_count: u32, big_endian: bool) -> FieldDecl {
    FieldDecl {
        name: name.to_string(),
        conditional: None,
        if_expression: None,
        size: SizeSpec::NONE,
        shuffle: false,
        offset: None,
        kind: FieldKind::Atom(AtomField {
            base_type: AtomBaseType::Unsigned,
            bit_count_expression: const_num(bit_count as f64),
            is_big_endian_expression: const_bool(big_endian),
            invariant_expression: None,
        }),
        parse_info: parse_info(),
    }
}

/// A fixed illustrative schema standing in for template-parser output: a
/// 4-byte magic, a 2-byte version, and an 8-element byte-array payload.
fn demo_structures() -> StructureMap {
    let element = atom_field("payload", 8, true);
    let payload = FieldDecl {
        size: SizeSpec {
            size_type: SizeType::Integer,
            expression: Some(const_num(8.0)),
        },
        shuffle: true,
        ..element
    };

    let mut structures = StructureMap::new();
    structures
        .define(
            "main",
            vec![atom_field("magic", 32, true), atom_field("version", 16, true), payload],
        )
        .expect("demo schema has no duplicate field names");
    structures
}

fn run_analyze(args: AnalyzeArgs) -> anyhow::Result<()> {
    let data = fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let structures = demo_structures();
    let mut out = std::io::stdout();
    let forest = analyze_binary(&structures, &data, "main", AnalyzerOptions::default(), &mut out)?;
    println!("{} nodes in inspection tree", forest.preorder(forest.root()).len());
    Ok(())
}

fn run_fuzz(args: FuzzArgs) -> anyhow::Result<()> {
    let data = fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let structures = demo_structures();
    let mut sink = std::io::sink();
    let forest = analyze_binary(
        &structures,
        &data,
        "main",
        AnalyzerOptions::default().with_quiet(true),
        &mut sink,
    )?;

    let options = FuzzOptions::default().with_recurse(args.recurse).with_path_hash(args.path_hash);
    let options = FuzzOptions {
        derivative_budget: args.budget,
        ..options
    };

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    bar.set_message("fuzzing...");
    bar.enable_steady_tick(std::time::Duration::from_millis(120));

    let report = fuzz(&forest, &args.input, &args.output, options)?;

    bar.finish_with_message(format!("wrote {} derivative(s)", report.files_written));
    println!("summary: {}", report.summary_path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli: Cli = argh::from_env();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Fuzz(args) => run_fuzz(args),
    }
}
