use garde::Validate;
use serde::{Deserialize, Serialize};

/// Structured fossil identification returned by the vision model.
///
/// Fields beyond the core four are preserved verbatim in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct Classification {
    #[garde(length(min = 1, max = 200))]
    pub fossil_name: String,

    #[garde(skip)]
    #[serde(default)]
    pub scientific_name: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub estimated_age: Option<String>,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[garde(skip)]
    #[serde(rename = "_metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ClassificationMetadata>,

    #[garde(skip)]
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationMetadata {
    pub num_images_analyzed: usize,
}

impl Classification {
    /// Models sometimes report confidence as a percentage.
    pub fn normalize(&mut self) {
        if self.confidence > 1.0 && self.confidence <= 100.0 {
            self.confidence /= 100.0;
        }
        self.fossil_name = self.fossil_name.trim().to_string();
    }
}
