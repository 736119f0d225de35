//! Deployment descriptor domain types
//!
//! Descriptors are structured (YAML) documents owned by the configuration
//! repository. Fields are addressed through a [`FieldPath`] such as
//! `spec.template.spec.containers[name=app].image`, never through text search,
//! so that a descriptor holding several image fields can only ever have the
//! addressed one rewritten.
//!
//! The file text is kept as read. An edit replaces the source span of the one
//! addressed scalar and nothing else, so comments, quoting and number formats
//! elsewhere in the file survive, and the cluster receives documents exactly
//! as committed.

use super::yaml_source::{self, Step};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while reading or editing descriptors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("failed to parse descriptor: {0}")]
    Parse(String),

    #[error("invalid field path '{0}'")]
    InvalidPath(String),

    #[error("descriptor '{document}' is missing required field '{field}'")]
    MissingField {
        document: String,
        field: &'static str,
    },

    #[error("no {kind} named '{name}' in descriptor")]
    DocumentNotFound { kind: DescriptorKind, name: String },

    #[error("field '{path}' not found in {document}")]
    FieldNotFound { document: String, path: String },

    #[error("field '{path}' in {document} cannot be rewritten in place")]
    NotEditable { document: String, path: String },
}

impl DescriptorError {
    /// True when the addressed document or field does not exist
    pub fn is_field_not_found(&self) -> bool {
        matches!(
            self,
            DescriptorError::DocumentNotFound { .. } | DescriptorError::FieldNotFound { .. }
        )
    }
}

// =============================================================================
// Field paths
// =============================================================================

/// One step of a [`FieldPath`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Mapping key
    Key(String),
    /// Sequence position
    Index(usize),
    /// The single sequence element whose `key` equals `value`
    Match { key: String, value: String },
}

/// Addressable location of a field inside a structured document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Resolves the path against a document
    ///
    /// A `Match` segment resolves only if exactly one element matches.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |node, segment| match segment {
                PathSegment::Key(key) => node.get(key.as_str()),
                PathSegment::Index(index) => node.get(*index),
                PathSegment::Match { key, value } => {
                    let sequence = node.as_sequence()?;
                    let index = unique_match(sequence, key, value)?;
                    sequence.get(index)
                }
            })
    }

    /// Mutable counterpart of [`FieldPath::resolve`]
    pub fn resolve_mut<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
        self.segments
            .iter()
            .try_fold(root, |node, segment| match segment {
                PathSegment::Key(key) => node.get_mut(key.as_str()),
                PathSegment::Index(index) => node.get_mut(*index),
                PathSegment::Match { key, value } => {
                    let index = unique_match(node.as_sequence()?, key, value)?;
                    node.as_sequence_mut()?.get_mut(index)
                }
            })
    }

    /// Keys and positions the path resolves to in `root`, selectors made concrete
    pub(crate) fn concrete_steps(&self, root: &Value) -> Option<Vec<Step>> {
        let mut node = root;
        let mut steps = Vec::with_capacity(self.segments.len());

        for segment in &self.segments {
            let (step, next) = match segment {
                PathSegment::Key(key) => (Step::Key(key.clone()), node.get(key.as_str())?),
                PathSegment::Index(index) => (Step::Index(*index), node.get(*index)?),
                PathSegment::Match { key, value } => {
                    let sequence = node.as_sequence()?;
                    let index = unique_match(sequence, key, value)?;
                    (Step::Index(index), sequence.get(index)?)
                }
            };
            steps.push(step);
            node = next;
        }

        Some(steps)
    }
}

fn unique_match(sequence: &[Value], key: &str, value: &str) -> Option<usize> {
    let mut matches = sequence
        .iter()
        .enumerate()
        .filter(|(_, item)| item.get(key).and_then(Value::as_str) == Some(value))
        .map(|(index, _)| index);

    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first)
}

fn parse_selector(selector: &str) -> Option<PathSegment> {
    match selector.split_once('=') {
        Some((key, value)) => {
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(PathSegment::Match {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        None => selector.trim().parse().ok().map(PathSegment::Index),
    }
}

impl FromStr for FieldPath {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DescriptorError::InvalidPath(s.to_string());

        if s.is_empty() || s.starts_with('.') || s.ends_with('.') {
            return Err(invalid());
        }

        let mut segments = Vec::new();
        let mut key = String::new();
        let mut after_selector = false;
        let mut chars = s.chars();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if key.is_empty() && !after_selector {
                        return Err(invalid());
                    }
                    if !key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut key)));
                    }
                    after_selector = false;
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut key)));
                    } else if segments.is_empty() {
                        return Err(invalid());
                    }

                    let mut selector = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        selector.push(c);
                    }
                    if !closed {
                        return Err(invalid());
                    }

                    segments.push(parse_selector(&selector).ok_or_else(invalid)?);
                    after_selector = true;
                }
                ']' => return Err(invalid()),
                _ => {
                    if after_selector {
                        return Err(invalid());
                    }
                    key.push(c);
                }
            }
        }

        if !key.is_empty() {
            segments.push(PathSegment::Key(key));
        }

        Ok(Self { segments })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{}", key)?,
                PathSegment::Key(key) => write!(f, ".{}", key)?,
                PathSegment::Index(index) => write!(f, "[{}]", index)?,
                PathSegment::Match { key, value } => write!(f, "[{}={}]", key, value)?,
            }
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Kind of a descriptor document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DescriptorKind {
    Deployment,
    Service,
    /// Any other object kind, passed through untouched
    Other(String),
}

impl From<String> for DescriptorKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "Deployment" => DescriptorKind::Deployment,
            "Service" => DescriptorKind::Service,
            _ => DescriptorKind::Other(kind),
        }
    }
}

impl From<DescriptorKind> for String {
    fn from(kind: DescriptorKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorKind::Deployment => write!(f, "Deployment"),
            DescriptorKind::Service => write!(f, "Service"),
            DescriptorKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// Summary of one descriptor document plus the document itself
///
/// Only `image` is ever rewritten by Conveyor (through the tag propagator);
/// everything in `document` is opaque pass-through to the cluster, which is
/// handed `source`, the document text as it appears in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    pub kind: DescriptorKind,
    pub name: String,
    pub replicas: Option<u32>,
    pub image: Option<String>,
    pub target_port: Option<u16>,
    pub document: Value,
    #[serde(default)]
    source: String,
}

impl DeploymentDescriptor {
    /// Builds a descriptor summary from a parsed document and its source text
    pub fn from_document(document: &Value, source: &str) -> Result<Self, DescriptorError> {
        let kind: DescriptorKind = document
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(DescriptorError::MissingField {
                document: "<unnamed>".to_string(),
                field: "kind",
            })?
            .to_string()
            .into();

        let name = document
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| DescriptorError::MissingField {
                document: kind.to_string(),
                field: "metadata.name",
            })?
            .to_string();

        let spec = document.get("spec");
        let first_container = spec
            .and_then(|s| s.get("template"))
            .and_then(|t| t.get("spec"))
            .and_then(|s| s.get("containers"))
            .and_then(|c| c.get(0));

        let (replicas, image, target_port) = match kind {
            DescriptorKind::Deployment => (
                spec.and_then(|s| s.get("replicas"))
                    .and_then(Value::as_u64)
                    .and_then(|r| u32::try_from(r).ok()),
                first_container
                    .and_then(|c| c.get("image"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                first_container
                    .and_then(|c| c.get("ports"))
                    .and_then(|p| p.get(0))
                    .and_then(|p| p.get("containerPort"))
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok()),
            ),
            DescriptorKind::Service => (
                None,
                None,
                spec.and_then(|s| s.get("ports"))
                    .and_then(|p| p.get(0))
                    .and_then(|p| p.get("targetPort"))
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok()),
            ),
            DescriptorKind::Other(_) => (None, None, None),
        };

        Ok(Self {
            kind,
            name,
            replicas,
            image,
            target_port,
            document: document.clone(),
            source: source.to_string(),
        })
    }

    /// Document text for submission to the cluster
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Address of the image-reference field inside a descriptor file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageField {
    pub kind: DescriptorKind,
    pub name: String,
    pub path: FieldPath,
}

impl ImageField {
    pub fn deployment(name: impl Into<String>, path: FieldPath) -> Self {
        Self {
            kind: DescriptorKind::Deployment,
            name: name.into(),
            path,
        }
    }
}

/// Result of writing an image reference into a descriptor set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpdate {
    pub previous: String,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Document {
    value: Value,
    span: Range<usize>,
}

/// All documents of one descriptor file, in file order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescriptorSet {
    source: String,
    documents: Vec<Document>,
}

impl DescriptorSet {
    /// Parses a (possibly multi-document) YAML descriptor file
    pub fn parse(source: &str) -> Result<Self, DescriptorError> {
        let mut documents = Vec::new();

        for span in yaml_source::document_spans(source) {
            let text = &source[span.clone()];
            if !yaml_source::has_content(text) {
                continue;
            }

            let value: Value =
                serde_yaml::from_str(text).map_err(|e| DescriptorError::Parse(e.to_string()))?;
            if !value.is_null() {
                documents.push(Document { value, span });
            }
        }

        Ok(Self {
            source: source.to_string(),
            documents,
        })
    }

    /// File text, including any edits made through this set
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Summaries of every document, in file order
    pub fn descriptors(&self) -> Result<Vec<DeploymentDescriptor>, DescriptorError> {
        self.documents
            .iter()
            .map(|doc| {
                DeploymentDescriptor::from_document(&doc.value, &self.source[doc.span.clone()])
            })
            .collect()
    }

    fn position(&self, field: &ImageField) -> Result<usize, DescriptorError> {
        let kind = field.kind.to_string();

        self.documents
            .iter()
            .position(|doc| {
                let doc_kind = doc.value.get("kind").and_then(Value::as_str);
                let doc_name = doc
                    .value
                    .get("metadata")
                    .and_then(|m| m.get("name"))
                    .and_then(Value::as_str);
                doc_kind == Some(kind.as_str()) && doc_name == Some(field.name.as_str())
            })
            .ok_or_else(|| DescriptorError::DocumentNotFound {
                kind: field.kind.clone(),
                name: field.name.clone(),
            })
    }

    /// Reads the current value of the addressed image field
    pub fn image_reference(&self, field: &ImageField) -> Result<&str, DescriptorError> {
        let index = self.position(field)?;

        field
            .path
            .resolve(&self.documents[index].value)
            .and_then(Value::as_str)
            .ok_or_else(|| DescriptorError::FieldNotFound {
                document: format!("{}/{}", field.kind, field.name),
                path: field.path.to_string(),
            })
    }

    /// Replaces the addressed image field; a no-op when it already holds `image_ref`
    ///
    /// Only the source text of that one scalar changes. Fails with
    /// [`DescriptorError::NotEditable`] when the field is not a single-line
    /// scalar in block-style YAML, leaving the set untouched.
    pub fn set_image_reference(
        &mut self,
        field: &ImageField,
        image_ref: &str,
    ) -> Result<ImageUpdate, DescriptorError> {
        let previous = self.image_reference(field)?.to_string();

        if previous == image_ref {
            return Ok(ImageUpdate {
                previous,
                changed: false,
            });
        }

        let not_editable = || DescriptorError::NotEditable {
            document: format!("{}/{}", field.kind, field.name),
            path: field.path.to_string(),
        };

        let index = self.position(field)?;
        let document = &self.documents[index];
        let text = &self.source[document.span.clone()];

        let scalar = field
            .path
            .concrete_steps(&document.value)
            .and_then(|steps| yaml_source::locate_scalar(text, &steps))
            .ok_or_else(not_editable)?;
        let raw = &text[scalar.clone()];
        if yaml_source::decode_scalar(raw).as_deref() != Some(previous.as_str()) {
            return Err(not_editable());
        }

        let start = document.span.start + scalar.start;
        let end = document.span.start + scalar.end;
        let source = format!(
            "{}{}{}",
            &self.source[..start],
            yaml_source::render_scalar(raw, image_ref),
            &self.source[end..]
        );

        let mut expected: Vec<Value> = self.documents.iter().map(|d| d.value.clone()).collect();
        if let Some(slot) = field.path.resolve_mut(&mut expected[index]) {
            *slot = Value::String(image_ref.to_string());
        }

        let updated = Self::parse(&source)?;
        if !updated.documents.iter().map(|d| &d.value).eq(expected.iter()) {
            return Err(not_editable());
        }
        *self = updated;

        Ok(ImageUpdate {
            previous,
            changed: true,
        })
    }
}
