//! Artifact loading
//!
//! A trained model reaches this core in one of three storage families:
//!   - a task-bundled ONNX export (`.onnx`) carrying its task and class names
//!     in the model metadata,
//!   - a plain traced ONNX graph (`.onnx`) with no task metadata,
//!   - a saved graph+weights bundle (OpenVINO IR, `.xml` with a side-by-side
//!     `.bin`).
//! The first two share an extension and are told apart by a structural probe
//! of the exporter metadata, expressed as a tagged result.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use openvino::{CompiledModel, Core, Model};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::engine::labels;
use crate::engine::preprocess::InputSpec;
use crate::error::ArtifactError;

/// Default artifact filenames probed when no explicit path is given, in
/// priority order.
const DEFAULT_BUNDLE_FILE: &str = "moodcam_best.onnx";
const DEFAULT_SAVED_GRAPH_FILE: &str = "model.xml";

/// Storage family of a loaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Task-bundled ONNX export: knows its own task and class names.
    Bundle,
    /// Saved graph+weights bundle with a declared input geometry.
    SavedGraph,
    /// Plain traced graph: fixed input geometry, raw logits out.
    TracedGraph,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Bundle => "bundle",
            ArtifactKind::SavedGraph => "saved_graph",
            ArtifactKind::TracedGraph => "traced_graph",
        }
    }
}

/// Task a bundle export declares about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleTask {
    Classify,
    Detect,
    Other(String),
}

impl BundleTask {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "classify" => BundleTask::Classify,
            "detect" => BundleTask::Detect,
            other => BundleTask::Other(other.to_string()),
        }
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync.
#[derive(Clone)]
pub struct SafeCompiledModel(Arc<CompiledModel>);

unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request.
    /// OpenVINO CompiledModel methods are thread-safe in C++, but the Rust
    /// bindings require `&mut self`. We bypass this restriction safely.
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

/// Backend handle plus the per-family facts the dispatcher needs. Closed:
/// the dispatcher matches over this exhaustively.
pub enum Backend {
    Bundle {
        session: Mutex<Session>,
        task: BundleTask,
        names: Option<Vec<String>>,
        image_size: Option<u32>,
    },
    SavedGraph {
        model: SafeCompiledModel,
        spec: InputSpec,
    },
    Traced {
        session: Mutex<Session>,
    },
}

/// A loaded, ready-to-run model artifact. Created once at process start,
/// immutable and shared read-only for the life of the process.
pub struct ModelArtifact {
    pub(crate) backend: Backend,
    path: PathBuf,
}

impl ModelArtifact {
    /// Load the artifact at `override_path`, the configured path, or the
    /// first default filename present in the models directory.
    ///
    /// After a successful load the process-wide class-name table is
    /// populated best-effort; a failure there is non-fatal.
    pub fn load(config: &Config, override_path: Option<&Path>) -> Result<Self, ArtifactError> {
        let path = match override_path.or(config.models.artifact.as_deref()) {
            Some(p) => {
                if !p.exists() {
                    return Err(ArtifactError::ArtifactNotFound {
                        searched: vec![p.to_path_buf()],
                    });
                }
                p.to_path_buf()
            }
            None => default_artifact(&config.models.dir)?,
        };

        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        let artifact = match extension.as_str() {
            "onnx" => load_onnx(&path)?,
            "xml" => load_saved_graph(&path, &config.models.device)?,
            _ => return Err(ArtifactError::UnsupportedArtifact { path, extension }),
        };

        if !labels::load_class_names(config.labels.class_names.as_deref()) {
            debug!("no external class-name table; labels fall back to embedded names or indices");
        }

        info!(
            "loaded {} artifact from {}",
            artifact.kind().as_str(),
            artifact.path.display()
        );
        Ok(artifact)
    }

    pub fn kind(&self) -> ArtifactKind {
        match &self.backend {
            Backend::Bundle { .. } => ArtifactKind::Bundle,
            Backend::SavedGraph { .. } => ArtifactKind::SavedGraph,
            Backend::Traced { .. } => ArtifactKind::TracedGraph,
        }
    }

    /// Class names embedded in the artifact itself, if any.
    pub fn declared_labels(&self) -> Option<&[String]> {
        match &self.backend {
            Backend::Bundle { names, .. } => names.as_deref(),
            _ => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn default_artifact(dir: &Path) -> Result<PathBuf, ArtifactError> {
    let candidates = [
        dir.join(DEFAULT_BUNDLE_FILE),
        dir.join(DEFAULT_SAVED_GRAPH_FILE),
    ];
    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }
    Err(ArtifactError::ArtifactNotFound {
        searched: candidates.to_vec(),
    })
}

/// Outcome of structurally probing a `.onnx` file's exporter metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OnnxProbe {
    /// Exporter task metadata present: task-bundled export.
    Bundle {
        task: BundleTask,
        names: Option<Vec<String>>,
        image_size: Option<u32>,
    },
    /// No task metadata: plain traced graph.
    Traced,
}

/// Classify a session by the presence of exporter metadata fields. A `names`
/// table without a `task` tag is treated as a classification export.
fn probe_metadata(
    task: Option<String>,
    names: Option<String>,
    image_size: Option<String>,
) -> OnnxProbe {
    if task.is_none() && names.is_none() {
        return OnnxProbe::Traced;
    }
    let task = match task {
        Some(raw) => BundleTask::parse(&raw),
        None => BundleTask::Classify,
    };
    OnnxProbe::Bundle {
        task,
        names: names.as_deref().and_then(labels::parse_embedded_names),
        image_size: image_size.as_deref().and_then(parse_image_size),
    }
}

/// Parse the exporter's `imgsz` value: either a bare number or a list
/// literal such as `[224, 224]`; the first entry wins.
fn parse_image_size(raw: &str) -> Option<u32> {
    raw.trim()
        .trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn load_onnx(path: &Path) -> Result<ModelArtifact, ArtifactError> {
    let start = Instant::now();
    let session = Session::builder()
        .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|builder| builder.commit_from_file(path))
        .map_err(|e| ArtifactError::load_error(path, "not a loadable ONNX graph", e))?;

    let (task, names, image_size) = match session.metadata() {
        Ok(metadata) => (
            metadata.custom("task").ok().flatten(),
            metadata.custom("names").ok().flatten(),
            metadata.custom("imgsz").ok().flatten(),
        ),
        Err(_) => (None, None, None),
    };

    let probe = probe_metadata(task, names, image_size);
    info!("probed {} in {:?}", path.display(), start.elapsed());

    let backend = match probe {
        OnnxProbe::Bundle {
            task,
            names,
            image_size,
        } => Backend::Bundle {
            session: Mutex::new(session),
            task,
            names,
            image_size,
        },
        OnnxProbe::Traced => Backend::Traced {
            session: Mutex::new(session),
        },
    };

    Ok(ModelArtifact {
        backend,
        path: path.to_path_buf(),
    })
}

fn load_saved_graph(path: &Path, device: &str) -> Result<ModelArtifact, ArtifactError> {
    let start = Instant::now();

    let mut core = Core::new().map_err(|e| ArtifactError::RuntimeMissing(Box::new(e)))?;

    let model = core
        .read_model_from_file(&path.to_string_lossy(), "")
        .map_err(|e| ArtifactError::load_error(path, "not a readable saved graph", e))?;

    let spec = declared_input_spec(&model)
        .map_err(|detail| ArtifactError::load_error(path, "unusable input declaration", detail))?;

    let compiled = core
        .compile_model(&model, device.into())
        .map_err(|e| ArtifactError::load_error(path, "saved graph failed to compile", e))?;

    info!(
        "loaded saved-graph artifact ({}x{}x{} input) in {:?}",
        spec.height,
        spec.width,
        spec.channels,
        start.elapsed()
    );

    Ok(ModelArtifact {
        backend: Backend::SavedGraph {
            model: SafeCompiledModel(Arc::new(compiled)),
            spec,
        },
        path: path.to_path_buf(),
    })
}

/// Read the declared `[1, H, W, C]` input geometry off the graph.
fn declared_input_spec(model: &Model) -> Result<InputSpec, String> {
    let input = model
        .get_input_by_index(0)
        .map_err(|e| format!("artifact declares no input port: {e:?}"))?;
    let shape = input
        .get_shape()
        .map_err(|e| format!("artifact input has no static shape: {e:?}"))?;
    let dims = shape.get_dimensions().to_vec();
    if dims.len() != 4 || dims[0] != 1 || dims[1] < 1 || dims[2] < 1 {
        return Err(format!(
            "artifact input shape {dims:?} is not a [1, H, W, C] image tensor"
        ));
    }
    Ok(InputSpec {
        height: dims[1] as u32,
        width: dims[2] as u32,
        channels: dims[3],
    })
}
