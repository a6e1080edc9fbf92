//! Core pipeline orchestration and domain logic for KnowTree.
//!
//! This crate ties together prerequisite exploration, the enrichment chain,
//! script generation and run assembly into the end-to-end `explain`
//! workflow ([`pipeline::run_pipeline`]).

pub mod analyzer;
pub mod assembler;
pub mod cache;
pub mod classifier;
pub mod codegen;
pub mod discoverer;
pub mod enrichment;
pub mod explorer;
pub mod guard;
pub mod pipeline;
pub mod tree;

#[cfg(test)]
mod testing;
