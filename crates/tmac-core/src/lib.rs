//! # tmac-core
//!
//! Backend-free building blocks of the tree-structured MAC network.
//!
//! A TMAC model runs a fixed tree of reasoning steps. Each step owns a
//! control vector ("what to look for") and a memory vector ("what was
//! found"), computed from the outputs of the step's children. This crate
//! holds everything about that structure that does not touch tensors:
//!
//! - [`ReasoningTree`]: validated `children_list`, traversal order, arity groups
//! - [`SharingPattern`] / [`UnitTable`]: step → unit-instance dispatch tables
//! - [`TmacConfig`]: construction-time options, loadable from JSON
//! - [`TmacError`]: the error enum shared by every `tmac-*` crate
//!
//! ## Architecture Rules
//!
//! - No numeric backend here; tensors live in `tmac-soft`.
//! - Everything is resolved once at construction and immutable afterwards.

pub mod config;
pub mod error;
pub mod sharing;
pub mod topology;

pub use config::{
    ClassifierConfig, InitConfig, InitScheme, StemConfig, TmacConfig, Vocab,
};
pub use error::TmacError;
pub use sharing::{SharingMode, SharingPattern, UnitKind, UnitTable};
pub use topology::{ReasoningTree, ROOT_STEP, SENTINEL_SLOT};
