use serde_json::{Map, Value};

use super::{Serialiser, SerialiserError, SerialiserResult};
use crate::page::Page;

/// JSON pages: a top-level object whose `content` key is the page body and
/// whose other keys are meta.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerialiser;

impl Serialiser for JsonSerialiser {
    fn name(&self) -> &str {
        "json"
    }

    fn decode(&self, path: &str, data: &[u8]) -> SerialiserResult<Page> {
        let mut meta: Map<String, Value> = serde_json::from_slice(data).map_err(|e| {
            SerialiserError::Decode { path: path.to_string(), reason: e.to_string() }
        })?;

        let content = match meta.remove("content") {
            Some(Value::String(content)) => content,
            Some(other) => {
                return Err(SerialiserError::Decode {
                    path: path.to_string(),
                    reason: format!("content must be a string, got {}", other),
                });
            }
            None => String::new(),
        };

        Ok(Page { path: path.to_string(), meta, content })
    }

    fn encode(&self, page: &Page) -> SerialiserResult<Vec<u8>> {
        let mut object = page.meta.clone();
        if !page.content.is_empty() {
            object.insert("content".to_string(), Value::String(page.content.clone()));
        }
        serde_json::to_vec_pretty(&object)
            .map_err(|e| SerialiserError::Encode { path: page.path.clone(), reason: e.to_string() })
    }
}
