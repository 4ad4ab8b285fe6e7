//! Where an interchange graph comes from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::core::InterchangeGraph;
use super::proto::ModelProto;
use super::wire;
use crate::errors::LanError;

/// A pretrained network: a file, a URL, an in-memory JSON document, or an
/// already-loaded graph.
///
/// Files and URLs may hold either a binary `.onnx` model or its
/// protobuf-JSON mapping; the encoding is detected from the content.
#[derive(Clone)]
pub enum ModelSource {
    Path(PathBuf),
    Url(String),
    Json(String),
    Graph(Arc<InterchangeGraph>),
}

impl ModelSource {
    /// Loads and validates the graph.
    pub fn load(&self) -> Result<Arc<InterchangeGraph>, LanError> {
        let graph = match self {
            ModelSource::Graph(graph) => return Ok(Arc::clone(graph)),
            ModelSource::Path(path) => {
                let origin = self.origin();
                let bytes = std::fs::read(path).map_err(|e| LanError::model_load(&origin, e))?;
                parse_model(&bytes, &origin)?
            }
            ModelSource::Url(url) => parse_model(&fetch(url)?, url)?,
            ModelSource::Json(text) => parse_json(text.as_bytes(), "<json>")?,
        };

        log::info!(
            "Loaded graph `{}` from {}: {} nodes, {} initializers",
            graph.name(),
            self.origin(),
            graph.nodes().len(),
            graph.initializers().len()
        );
        Ok(Arc::new(graph))
    }

    /// Key identifying this source for caching.
    ///
    /// Paths and URLs are keyed by their text, JSON documents by their
    /// content, and in-memory graphs by their [`GraphId`](super::GraphId).
    pub fn cache_key(&self) -> String {
        match self {
            ModelSource::Path(path) => format!("path:{}", path.display()),
            ModelSource::Url(url) => format!("url:{url}"),
            ModelSource::Json(text) => format!("json:{text}"),
            ModelSource::Graph(graph) => format!("graph:{}", graph.id()),
        }
    }

    fn origin(&self) -> String {
        match self {
            ModelSource::Path(path) => path.display().to_string(),
            ModelSource::Url(url) => url.clone(),
            ModelSource::Json(_) => "<json>".to_string(),
            ModelSource::Graph(graph) => format!("<graph {}>", graph.id()),
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Json(text) => write!(f, "Json({} bytes)", text.len()),
            other => write!(f, "{}", other.origin()),
        }
    }
}

impl From<&str> for ModelSource {
    fn from(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            ModelSource::Url(value.to_string())
        } else {
            ModelSource::Path(PathBuf::from(value))
        }
    }
}

impl From<String> for ModelSource {
    fn from(value: String) -> Self {
        ModelSource::from(value.as_str())
    }
}

impl From<PathBuf> for ModelSource {
    fn from(value: PathBuf) -> Self {
        ModelSource::Path(value)
    }
}

impl From<&Path> for ModelSource {
    fn from(value: &Path) -> Self {
        ModelSource::Path(value.to_path_buf())
    }
}

impl From<Arc<InterchangeGraph>> for ModelSource {
    fn from(value: Arc<InterchangeGraph>) -> Self {
        ModelSource::Graph(value)
    }
}

impl From<InterchangeGraph> for ModelSource {
    fn from(value: InterchangeGraph) -> Self {
        ModelSource::Graph(Arc::new(value))
    }
}

/// True when the first non-whitespace byte opens a JSON object. A binary
/// `ModelProto` never starts with `{` (field 15, wire type 3).
fn is_json(bytes: &[u8]) -> bool {
    bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{')
}

fn parse_model(bytes: &[u8], origin: &str) -> Result<InterchangeGraph, LanError> {
    if is_json(bytes) {
        return parse_json(bytes, origin);
    }
    let model = wire::decode_model(bytes).map_err(|e| {
        LanError::model_load(origin, format!("not an ONNX model (protobuf or JSON): {e}"))
    })?;
    log::debug!("Decoded binary ONNX model from {origin} ({} bytes)", bytes.len());
    into_graph(model, origin)
}

fn parse_json(bytes: &[u8], origin: &str) -> Result<InterchangeGraph, LanError> {
    let model: ModelProto =
        serde_json::from_slice(bytes).map_err(|e| LanError::model_load(origin, e))?;
    into_graph(model, origin)
}

fn into_graph(model: ModelProto, origin: &str) -> Result<InterchangeGraph, LanError> {
    InterchangeGraph::from_proto(model).map_err(|e| LanError::model_load(origin, e))
}

#[cfg(feature = "remote")]
fn fetch(url: &str) -> Result<Vec<u8>, LanError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("hssm-lan/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LanError::model_load(url, e.to_string()))?;

    let response = client
        .get(url)
        .header("Accept", "application/octet-stream, application/json")
        .send()
        .map_err(|e| LanError::model_load(url, e.to_string()))?;
    if !response.status().is_success() {
        return Err(LanError::model_load(url, format!("HTTP {}", response.status())));
    }
    response
        .bytes()
        .map(|body| body.to_vec())
        .map_err(|e| LanError::model_load(url, e.to_string()))
}

#[cfg(not(feature = "remote"))]
fn fetch(url: &str) -> Result<Vec<u8>, LanError> {
    Err(LanError::model_load(
        url,
        "URL sources need the `remote` feature",
    ))
}
