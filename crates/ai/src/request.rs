use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Input for a title/description generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub template_name: String,
    pub prompt: String,
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
    pub locale: String,
}

impl MetadataRequest {
    pub fn new(template_name: impl Into<String>, prompt: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            prompt: prompt.into(),
            parameters: Map::new(),
            locale: locale.into(),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, JsonValue>) -> Self {
        self.parameters = parameters;
        self
    }
}
