//! Error taxonomy for the mood inference core.
//!
//! Load-time failures (`ArtifactError`) are fatal to startup and surfaced to
//! operators. Inference-time failures (`PredictError`) fail the single
//! request; the process keeps serving.

use std::path::PathBuf;

use thiserror::Error;

type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Failures while locating or loading a model artifact.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("no model artifact found; searched {searched:?} — place a trained artifact there or pass an explicit path")]
    ArtifactNotFound { searched: Vec<PathBuf> },

    #[error("unrecognized artifact extension {extension:?} for {path}; supported: .onnx (task-bundled export or plain traced graph), .xml (saved graph with weights)")]
    UnsupportedArtifact { path: PathBuf, extension: String },

    #[error("failed to load artifact {path}: {detail}. A task-bundled model must be exported with its trainer's ONNX exporter (task metadata embedded); a plain traced graph must be exported as a bare ONNX graph; a saved graph needs its .bin weights next to the .xml")]
    ArtifactLoadError {
        path: PathBuf,
        detail: String,
        #[source]
        source: BoxedCause,
    },

    #[error("inference runtime unavailable — install the OpenVINO runtime or switch to an .onnx artifact")]
    RuntimeMissing(#[source] BoxedCause),
}

impl ArtifactError {
    pub fn load_error(
        path: impl Into<PathBuf>,
        detail: impl Into<String>,
        source: impl Into<BoxedCause>,
    ) -> Self {
        ArtifactError::ArtifactLoadError {
            path: path.into(),
            detail: detail.into(),
            source: source.into(),
        }
    }
}

/// Failures while running a single prediction.
#[derive(Error, Debug)]
pub enum PredictError {
    #[error("no model artifact is loaded")]
    ModelUnavailable,

    #[error("unsupported channel count {channels} in the artifact's declared input shape; expected 1 (grayscale) or 3 (color)")]
    UnsupportedChannelSpec { channels: i64 },

    #[error("model output of shape {shape:?} cannot be flattened to a single class-score vector")]
    ShapeMismatch { shape: Vec<i64> },

    #[error("model returned no usable boxes, classes or confidences")]
    NoUsableOutput,

    #[error("inference produced no output tensors")]
    EmptyResults,

    #[error("unsupported artifact task {task:?}; this core handles classify and detect exports")]
    UnsupportedArtifactKind { task: String },

    #[error("inference backend failure: {0}")]
    Backend(#[source] BoxedCause),
}

impl PredictError {
    pub fn backend(source: impl Into<BoxedCause>) -> Self {
        PredictError::Backend(source.into())
    }
}
