//! # LG-Core
//!
//! Core types for the latent-graph detector: per-image metadata, the
//! ground-truth/prediction source selection rule, and dense-mask
//! polygonization. Nothing in this crate depends on a tensor library.

pub mod error;
pub mod geometry;
pub mod source;
pub mod types;

pub use error::{Error, Result};
pub use geometry::*;
pub use source::*;
pub use types::*;
