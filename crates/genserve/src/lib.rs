#![doc = include_str!("../README.md")]

pub mod bridge;
mod common;
pub mod detokenize;
pub mod runtime;
pub mod stop;
pub mod tokenizer;
pub mod worker;

pub use common::*;
