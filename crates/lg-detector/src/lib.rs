//! # LG-Detector
//!
//! Object detection augmented with a latent scene graph.
//!
//! ## Pipeline
//!
//! 1. **Detector**: external model behind [`DetectorAdapter`], run without
//!    gradients to obtain instances
//! 2. **Feature extraction**: one visual feature per instance, by ROI
//!    pooling or detector queries, from annotated or predicted boxes
//! 3. **Semantic encoder**: box, class, polygonized mask and score projected
//!    to a dense embedding, mirrored for edges
//! 4. **Graph head**: nodes and edges over the instances
//! 5. **Reconstruction head**: image rebuilt from instance and graph features
//! 6. **Downstream head**: graph-conditioned auxiliary predictions
//!
//! Per-image outputs are folded back onto [`DetDataSample`]s and optionally
//! rescaled to original resolution.

pub mod aggregate;
pub mod batching;
pub mod bbox;
pub mod config;
pub mod error;
pub mod features;
pub mod heads;
pub mod losses;
pub mod model;
pub mod roi;
pub mod semantic;
pub mod structures;

pub use aggregate::*;
pub use batching::*;
pub use bbox::*;
pub use config::*;
pub use error::{Error, Result};
pub use features::*;
pub use heads::*;
pub use losses::*;
pub use model::*;
pub use roi::*;
pub use semantic::*;
pub use structures::*;
