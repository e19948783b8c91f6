#![doc = include_str!("../../README.MD")]

pub mod analyzer;
pub mod ast;
pub mod attack_surface;
pub mod bitreader;
pub mod expr;
pub mod forest;
pub mod fuzz;
pub mod position;
pub mod value;
