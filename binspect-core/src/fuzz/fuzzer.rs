//! The fuzzer (`spec.md` §4.I): flat and recursive derivative generation
//! over an attack surface.
//!
//! Flat mode mutates every attack vector once per generator. Recursive mode
//! stochastically chains derivatives: each round picks one attack vector and
//! one generator, writes a file, and with probability `recursion_probability`
//! treats that file as the next round's input. Rounds run concurrently via
//! `rayon`, bounded by `derivative_budget` total files.

use crate::attack_surface::AttackSurface;
use crate::forest::{Forest, NodeId};
use crate::fuzz::generators;
use crate::value::AtomBaseType;
use rand::Rng;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct FuzzOptions {
    pub path_hash: bool,
    pub recurse: bool,
    pub recursion_probability: f64,
    pub derivative_budget: usize,
}

impl Default for FuzzOptions {
    fn default() -> Self {
        FuzzOptions {
            path_hash: false,
            recurse: false,
            recursion_probability: 0.8,
            derivative_budget: 10_000,
        }
    }
}

impl FuzzOptions {
    pub fn with_path_hash(mut self, enabled: bool) -> Self {
        self.path_hash = enabled;
        self
    }

    /// Recursive mode forces path hashing, per `spec.md` §4.I.
    pub fn with_recurse(mut self, enabled: bool) -> Self {
        self.recurse = enabled;
        if enabled {
            self.path_hash = true;
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct FuzzReport {
    pub output_dir: PathBuf,
    pub summary_path: PathBuf,
    pub files_written: usize,
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `<base>_<offset>_<gen_id><ext>`, or with `path_hash` set, the prefix
/// before `_<gen_id>` replaced by a hex FNV-1a hash of `base_offset`.
fn derivative_name(base: &str, ext: &str, offset: u64, gen_id: &str, path_hash: bool) -> String {
    if path_hash {
        let hash = fnv1a(format!("{base}_{offset}").as_bytes());
        format!("{hash:016x}_{gen_id}{ext}")
    } else {
        format!("{base}_{offset}_{gen_id}{ext}")
    }
}

struct SummarySink(Mutex<String>);

impl SummarySink {
    fn new() -> Self {
        SummarySink(Mutex::new(String::new()))
    }

    fn append(&self, line: &str) {
        let mut buf = self.0.lock().expect("summary sink poisoned");
        buf.push_str(line);
        buf.push('\n');
    }

    fn into_inner(self) -> String {
        self.0.into_inner().expect("summary sink poisoned")
    }
}

struct PathRegistry(Mutex<FxHashSet<PathBuf>>);

impl PathRegistry {
    fn new() -> Self {
        PathRegistry(Mutex::new(FxHashSet::default()))
    }

    /// Returns `true` if `path` was not already claimed by a previous write.
    fn claim(&self, path: &Path) -> bool {
        self.0.lock().expect("path registry poisoned").insert(path.to_path_buf())
    }
}

/// Splices `mutation` into a copy of `base_bytes` at `offset` and writes it
/// under `dir`, unless `name` was already claimed by another round.
fn write_derivative(
    base_bytes: &[u8],
    dir: &Path,
    name: &str,
    offset: u64,
    mutation: &[u8],
    registry: &PathRegistry,
) -> Result<Option<PathBuf>, FuzzError> {
    let path = dir.join(name);
    if !registry.claim(&path) {
        return Ok(None);
    }
    let mut out = base_bytes.to_vec();
    let start = offset as usize;
    out[start..start + mutation.len()].copy_from_slice(mutation);
    fs::write(&path, out)?;
    Ok(Some(path))
}

/// The five fixed generators plus one per discovered enumerated option, for
/// one atom usage entry. Entries with non-byte-aligned width produce none.
fn atom_candidates(
    raw_bytes: &[u8],
    bit_count: u32,
    base_type: AtomBaseType,
    big_endian: bool,
    options: Option<&crate::forest::OptionSet>,
    rng: &mut impl Rng,
) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    if bit_count == 0 || bit_count % 8 != 0 {
        return out;
    }
    let byte_count = (bit_count / 8) as usize;

    out.push(("zero".to_string(), generators::zero(byte_count)));
    out.push(("ones".to_string(), generators::ones(byte_count)));
    out.push(("rand".to_string(), generators::rand(byte_count, rng)));
    if let Some(bytes) = generators::less(raw_bytes, bit_count, base_type, big_endian) {
        out.push(("less".to_string(), bytes));
    }
    if let Some(bytes) = generators::more(raw_bytes, bit_count, base_type, big_endian) {
        out.push(("more".to_string(), bytes));
    }
    if let Some(option_set) = options {
        for (i, value) in option_set.values().enumerate() {
            if let Some(bytes) = generators::enumerated(value, base_type, big_endian, bit_count) {
                out.push((format!("enum{i}"), bytes));
            }
        }
    }
    out
}

/// Byte span `[start, end)` of a node, mirroring the struct/array-root vs.
/// atom split the expression VM's `sizeof`/`startof`/`endof` builtins use.
fn element_span(forest: &Forest, id: NodeId) -> (u64, u64) {
    let node = forest.get(id);
    if node.flags.is_struct || node.flags.is_array_root {
        (node.start_offset.bytes(), node.end_offset.bytes() + 1)
    } else {
        let bit_count = forest.effective_bit_count(id);
        (node.location.bytes(), node.location.bytes() + (bit_count / 8) as u64)
    }
}

/// Left-rotations of a shuffleable array's element sequence, one per
/// non-identity rotation amount. Refuses (with a reason) if the elements
/// aren't laid out contiguously and equally wide.
fn shuffle_rotations(forest: &Forest, array_id: NodeId, data: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let children = forest.children(array_id);
    if children.len() < 2 {
        return Ok(Vec::new());
    }

    let mut spans: Vec<(u64, u64)> = children.iter().map(|&c| element_span(forest, c)).collect();
    spans.sort_by_key(|&(start, _)| start);

    let element_len = spans[0].1 - spans[0].0;
    if element_len == 0 {
        return Err("zero-width element".to_string());
    }
    for &(start, end) in &spans {
        if end - start != element_len {
            return Err(format!(
                "element at byte {start} has width {}, expected {element_len}",
                end - start
            ));
        }
    }
    for pair in spans.windows(2) {
        if pair[0].1 != pair[1].0 {
            return Err(format!("gap between elements ending at {} and starting at {}", pair[0].1, pair[1].0));
        }
    }

    let prefix_end = spans[0].0 as usize;
    let suffix_start = spans.last().unwrap().1 as usize;
    if suffix_start > data.len() {
        return Err("array span exceeds file length".to_string());
    }
    let array_bytes = data[prefix_end..suffix_start].to_vec();
    let n = spans.len();
    let elem = element_len as usize;

    let mut rotations = Vec::with_capacity(n - 1);
    for shift in 1..n {
        let mut rotated = Vec::with_capacity(data.len());
        rotated.extend_from_slice(&data[..prefix_end]);
        rotated.extend_from_slice(&array_bytes[shift * elem..]);
        rotated.extend_from_slice(&array_bytes[..shift * elem]);
        rotated.extend_from_slice(&data[suffix_start..]);
        rotations.push(rotated);
    }
    Ok(rotations)
}

fn fuzz_flat(
    surface: &AttackSurface,
    forest: &Forest,
    data: &[u8],
    dir: &Path,
    base: &str,
    ext: &str,
    options: &FuzzOptions,
    sink: &SummarySink,
    registry: &PathRegistry,
) -> Result<usize, FuzzError> {
    let written = AtomicUsize::new(0);

    surface.atom_usage.par_iter().try_for_each(|usage| -> Result<(), FuzzError> {
        let mut rng = rand::thread_rng();
        let offset = usage.node.location.bytes();

        if usage.node.bit_count % 8 != 0 {
            sink.append(&format!(
                "atom_usage {} offset={} SKIPPED: {} bits is not byte-aligned",
                usage.path, offset, usage.node.bit_count
            ));
            return Ok(());
        }

        let byte_count = (usage.node.bit_count / 8) as usize;
        let raw = &data[offset as usize..offset as usize + byte_count];
        let base_type = usage.node.base_type.unwrap_or(AtomBaseType::Unsigned);
        let candidates = atom_candidates(
            raw,
            usage.node.bit_count,
            base_type,
            usage.node.big_endian,
            usage.node.option_set.as_ref(),
            &mut rng,
        );

        sink.append(&format!(
            "atom_usage {} offset={} bits={} type={:?} big_endian={} uses={} variants={}",
            usage.path, offset, usage.node.bit_count, base_type, usage.node.big_endian, usage.use_count, candidates.len()
        ));

        for (gen_id, bytes) in candidates {
            let name = derivative_name(base, ext, offset, &gen_id, options.path_hash);
            if let Some(path) = write_derivative(data, dir, &name, offset, &bytes, registry)? {
                sink.append(&format!("  -> {}", path.display()));
                written.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    })?;

    surface.array_shuffle.par_iter().try_for_each(|shuffle| -> Result<(), FuzzError> {
        let offset = shuffle.node.start_offset.bytes();
        match shuffle_rotations(forest, shuffle.node_id, data) {
            Ok(rotations) => {
                sink.append(&format!(
                    "array_shuffle {} elements={} rotations={}",
                    shuffle.path,
                    shuffle.node.cardinal,
                    rotations.len()
                ));
                for (i, rotated) in rotations.into_iter().enumerate() {
                    let name = derivative_name(base, ext, offset, &format!("shuffle{i}"), options.path_hash);
                    let path = dir.join(&name);
                    if registry.claim(&path) {
                        fs::write(&path, rotated)?;
                        sink.append(&format!("  -> {}", path.display()));
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(reason) => {
                sink.append(&format!("array_shuffle {} SKIPPED: {}", shuffle.path, reason));
            }
        }
        Ok(())
    })?;

    Ok(written.load(Ordering::Relaxed))
}

/// Picks one random attack vector, then one random applicable generator for
/// it, returning `(generator id, splice offset, replacement bytes)`.
fn pick_mutation(
    surface: &AttackSurface,
    forest: &Forest,
    current: &[u8],
    rng: &mut impl Rng,
) -> Option<(String, u64, Vec<u8>)> {
    let total = surface.atom_usage.len() + surface.array_shuffle.len();
    if total == 0 {
        return None;
    }
    let pick = rng.gen_range(0..total);

    if pick < surface.atom_usage.len() {
        let usage = &surface.atom_usage[pick];
        if usage.node.bit_count % 8 != 0 {
            return None;
        }
        let offset = usage.node.location.bytes();
        let byte_count = (usage.node.bit_count / 8) as usize;
        let raw = current.get(offset as usize..offset as usize + byte_count)?;
        let base_type = usage.node.base_type.unwrap_or(AtomBaseType::Unsigned);
        let mut candidates = atom_candidates(
            raw,
            usage.node.bit_count,
            base_type,
            usage.node.big_endian,
            usage.node.option_set.as_ref(),
            rng,
        );
        if candidates.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..candidates.len());
        let (gen_id, bytes) = candidates.swap_remove(idx);
        Some((gen_id, offset, bytes))
    } else {
        let shuffle = &surface.array_shuffle[pick - surface.atom_usage.len()];
        let rotations = shuffle_rotations(forest, shuffle.node_id, current).ok()?;
        if rotations.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..rotations.len());
        // A rotation replaces the whole file, so it's represented as a
        // zero-offset splice whose length covers the entire buffer.
        Some((format!("shuffle{idx}"), 0, rotations[idx].clone()))
    }
}

fn fuzz_recursive(
    surface: &AttackSurface,
    forest: &Forest,
    data: &[u8],
    dir: &Path,
    base: &str,
    ext: &str,
    options: &FuzzOptions,
    sink: &SummarySink,
    registry: &PathRegistry,
) -> Result<usize, FuzzError> {
    let written = AtomicUsize::new(0);
    let seeds = rayon::current_num_threads().max(1);

    (0..seeds).into_par_iter().try_for_each(|seed| -> Result<(), FuzzError> {
        let mut rng = rand::thread_rng();
        let mut current = data.to_vec();

        loop {
            if written.load(Ordering::Relaxed) >= options.derivative_budget {
                break;
            }
            let Some((gen_id, offset, mutation)) = pick_mutation(surface, forest, &current, &mut rng) else {
                break;
            };

            let mut mutated = current.clone();
            let start = offset as usize;
            mutated[start..start + mutation.len()].copy_from_slice(&mutation);

            let name = derivative_name(&format!("{base}_r{seed}"), ext, offset, &gen_id, true);
            let path = dir.join(&name);
            if !registry.claim(&path) {
                break;
            }
            fs::write(&path, &mutated)?;
            sink.append(&format!("recursive seed={seed} {gen_id} -> {}", path.display()));
            written.fetch_add(1, Ordering::Relaxed);

            if rng.gen::<f64>() >= options.recursion_probability {
                break;
            }
            current = mutated;
        }
        Ok(())
    })?;

    Ok(written.load(Ordering::Relaxed))
}

/// Entry point: mutates the attack surface `forest` found in `input_path`,
/// writing derivatives and a summary file under `<output_dir>/fuzzed/`.
pub fn fuzz(
    forest: &Forest,
    input_path: &Path,
    output_dir: &Path,
    options: FuzzOptions,
) -> Result<FuzzReport, FuzzError> {
    let surface = AttackSurface::build(forest);
    let data = fs::read(input_path)?;

    let fuzzed_dir = output_dir.join("fuzzed");
    fs::create_dir_all(&fuzzed_dir)?;

    let stem = input_path.file_stem().and_then(|s| s.to_str()).unwrap_or("input");
    let base = sanitize_filename::sanitize(stem);
    let ext = input_path
        .extension()
        .and_then(|s| s.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let sink = SummarySink::new();
    let registry = PathRegistry::new();

    let files_written = if options.recurse {
        fuzz_recursive(&surface, forest, &data, &fuzzed_dir, &base, &ext, &options, &sink, &registry)?
    } else {
        fuzz_flat(&surface, forest, &data, &fuzzed_dir, &base, &ext, &options, &sink, &registry)?
    };

    let summary_path = fuzzed_dir.join(format!("{base}_fuzzing_summary.txt"));
    fs::write(&summary_path, sink.into_inner())?;

    Ok(FuzzReport {
        output_dir: fuzzed_dir,
        summary_path,
        files_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    #[test]
    fn fnv1a_is_deterministic() {
        assert_eq!(fnv1a(b"hello"), fnv1a(b"hello"));
        assert_ne!(fnv1a(b"hello"), fnv1a(b"world"));
    }

    #[test]
    fn derivative_name_without_hash_is_readable() {
        let name = derivative_name("sample", ".bin", 12, "zero", false);
        assert_eq!(name, "sample_12_zero.bin");
    }

    #[test]
    fn derivative_name_with_hash_replaces_prefix() {
        let name = derivative_name("sample", ".bin", 12, "zero", true);
        assert!(name.ends_with("_zero.bin"));
        assert!(!name.starts_with("sample"));
    }

    #[test]
    fn shuffle_rotations_produce_n_minus_one_left_rotations() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let arr = forest.insert_child(root, "data");
        forest.get_mut(arr).flags.is_array_root = true;

        let data = vec![0xAAu8, 0xBB, 0xCC, 0xDD];
        for (i, offset) in [0u64, 1, 2, 3].iter().enumerate() {
            let child = forest.insert_child(arr, "data");
            let node = forest.get_mut(child);
            node.flags.is_atom = true;
            node.flags.is_array_element = true;
            node.cardinal = i as u64;
            node.location = Position::from_bytes(*offset);
            node.bit_count = 8;
        }

        let rotations = shuffle_rotations(&forest, arr, &data).unwrap();
        assert_eq!(rotations.len(), 3);
        assert_eq!(rotations[0], vec![0xBB, 0xCC, 0xDD, 0xAA]);
        assert_eq!(rotations[1], vec![0xCC, 0xDD, 0xAA, 0xBB]);
        assert_eq!(rotations[2], vec![0xDD, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn shuffle_rotations_refuses_non_contiguous_elements() {
        let mut forest = Forest::new();
        let root = forest.set_root("main", "main");
        let arr = forest.insert_child(root, "data");
        forest.get_mut(arr).flags.is_array_root = true;

        for offset in [0u64, 2] {
            let child = forest.insert_child(arr, "data");
            let node = forest.get_mut(child);
            node.flags.is_atom = true;
            node.flags.is_array_element = true;
            node.location = Position::from_bytes(offset);
            node.bit_count = 8;
        }

        let data = vec![0u8; 4];
        assert!(shuffle_rotations(&forest, arr, &data).is_err());
    }

    #[test]
    fn atom_usage_with_empty_option_set_still_yields_fixed_generators() {
        let mut rng = rand::thread_rng();
        let raw = [10u8];
        let candidates = atom_candidates(&raw, 8, AtomBaseType::Unsigned, true, None, &mut rng);
        let ids: Vec<_> = candidates.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"zero"));
        assert!(ids.contains(&"ones"));
        assert!(ids.contains(&"less"));
        assert!(ids.contains(&"more"));
    }
}
