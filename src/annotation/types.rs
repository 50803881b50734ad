use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_RANDOM_LEN: usize = 6;

/// Annotation object id: `<millis base36>-<6 random base36>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationId(String);

impl AnnotationId {
    pub fn generate() -> Self {
        let mut id = to_base36(now_millis());
        id.push('-');
        let mut rng = rand::rng();
        for _ in 0..ID_RANDOM_LEN {
            id.push(BASE36[rng.random_range(0..BASE36.len())] as char);
        }
        Self(id)
    }

    /// Generate until `taken` says the id is free.
    pub fn generate_unique(taken: impl Fn(&AnnotationId) -> bool) -> Self {
        loop {
            let id = Self::generate();
            if !taken(&id) {
                return id;
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnnotationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Path,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

fn default_stroke() -> String {
    "#000000".to_string()
}

fn default_stroke_width() -> f64 {
    2.0
}

fn unit_scale() -> f64 {
    1.0
}

/// Freehand stroke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathShape {
    pub points: Vec<Point>,
    #[serde(default = "default_stroke")]
    pub stroke: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
}

/// Text box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextShape {
    pub text: String,
    pub left: f64,
    pub top: f64,
    pub font_size: f64,
    #[serde(default = "default_stroke")]
    pub fill: String,
    #[serde(default)]
    pub angle: f64,
    #[serde(default = "unit_scale")]
    pub scale_x: f64,
    #[serde(default = "unit_scale")]
    pub scale_y: f64,
}

/// Geometry and style: the only fields a remote update may change.
/// Anything else a peer sends along is dropped at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    Path(PathShape),
    Text(TextShape),
}

impl Shape {
    pub fn kind(&self) -> AnnotationKind {
        match self {
            Shape::Path(_) => AnnotationKind::Path,
            Shape::Text(_) => AnnotationKind::Text,
        }
    }
}

/// Object as carried by `draw-path` / `draw-text`; the id may be missing
/// on objects that were never synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<AnnotationId>,
    #[serde(flatten)]
    pub shape: Shape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl WireObject {
    pub fn new(shape: Shape) -> Self {
        Self {
            id: None,
            shape,
            version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationObject {
    pub id: AnnotationId,
    pub slide_index: usize,
    pub shape: Shape,
    /// Last writer's timestamp (ms); recorded, not used for ordering
    pub version: u64,
}

impl AnnotationObject {
    /// Build from a wire object, minting an id if it has none.
    pub fn from_wire(object: WireObject, slide_index: usize) -> Self {
        Self {
            id: object.id.unwrap_or_else(AnnotationId::generate),
            slide_index,
            shape: object.shape,
            version: object.version.unwrap_or_else(now_millis),
        }
    }

    pub fn kind(&self) -> AnnotationKind {
        self.shape.kind()
    }

    pub fn to_wire(&self) -> WireObject {
        WireObject {
            id: Some(self.id.clone()),
            shape: self.shape.clone(),
            version: Some(self.version),
        }
    }
}
