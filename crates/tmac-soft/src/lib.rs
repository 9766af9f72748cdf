//! # tmac-soft
//!
//! Candle implementation of the tree-structured Compositional Attention
//! Network (TMAC).
//!
//! A question and an image go through a tree of reasoning steps. Each
//! step runs a Control → Read → Write cell fed by its children's outputs;
//! the root's memory drives an answer classifier.
//!
//! ## Key Components
//!
//! - [`model::Tmac`]: the full model and its forward pass
//! - [`control_unit::ControlUnit`]: attention over question tokens
//! - [`read_unit::ReadUnit`]: attention over image cells
//! - [`write_unit::WriteUnit`]: affine memory update
//! - [`output_unit::OutputUnit`]: answer classifier
//! - [`storage::StepStorage`]: write-once per-step control/memory slots
//! - [`stem::Stem`]: convolutional image stem
//!
//! Topology, sharing and configuration live in [`tmac_core`].
//!
//! ## GPU Support
//!
//! ```bash
//! cargo test -p tmac-soft --features cuda
//! ```

pub use tmac_core;

pub mod attention;
pub mod control_unit;
pub mod coords;
pub mod init;
pub mod input_unit;
pub mod model;
pub mod output_unit;
pub mod read_unit;
pub mod stem;
pub mod storage;
pub mod write_unit;

#[cfg(test)]
mod test_util;

pub use model::{Activations, Question, Tmac, UnitCounts};
