//! Inference engine module
//!
//! Artifact loading, face location, preprocessing and prediction dispatch.

pub mod artifact;
pub mod labels;
pub mod locator;
pub mod predict;
pub mod preprocess;

pub use artifact::{ArtifactKind, ModelArtifact};
pub use locator::{BoundingBox, FaceLocator};
pub use predict::{PredictionResult, Predictor};
