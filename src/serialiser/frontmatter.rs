use serde_json::{Map, Value};

use super::{Serialiser, SerialiserError, SerialiserResult};
use crate::page::Page;

const FENCE: &str = "+++";

/// Markdown/MDX pages with optional TOML front matter between `+++` fences.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrontmatterSerialiser;

impl Serialiser for FrontmatterSerialiser {
    fn name(&self) -> &str {
        "frontmatter"
    }

    fn decode(&self, path: &str, data: &[u8]) -> SerialiserResult<Page> {
        let text = std::str::from_utf8(data).map_err(|e| SerialiserError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let Some(after_open) = text.strip_prefix(FENCE).and_then(strip_line_break) else {
            return Ok(Page { path: path.to_string(), meta: Map::new(), content: text.to_string() });
        };

        let (header, body) = split_at_fence(after_open).ok_or_else(|| SerialiserError::Decode {
            path: path.to_string(),
            reason: "unterminated front matter".to_string(),
        })?;

        let meta: Map<String, Value> = toml::from_str(header).map_err(|e| {
            SerialiserError::Decode { path: path.to_string(), reason: e.to_string() }
        })?;

        Ok(Page { path: path.to_string(), meta, content: body.to_string() })
    }

    fn encode(&self, page: &Page) -> SerialiserResult<Vec<u8>> {
        if page.meta.is_empty() {
            return Ok(page.content.clone().into_bytes());
        }

        let header = toml::to_string(&page.meta).map_err(|e| {
            SerialiserError::Encode { path: page.path.clone(), reason: e.to_string() }
        })?;

        Ok(format!("{FENCE}\n{}{FENCE}\n{}", header, page.content).into_bytes())
    }
}

fn strip_line_break(text: &str) -> Option<&str> {
    text.strip_prefix("\r\n").or_else(|| text.strip_prefix('\n'))
}

/// Split at the closing fence line, returning (header, body).
fn split_at_fence(text: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            return Some((&text[..offset], &text[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_with_front_matter() {
        let source = "+++\ntitle = \"Intro\"\ntags = [\"a\", \"b\"]\n+++\n# Hello\n";
        let page = FrontmatterSerialiser.decode("/intro.mdx", source.as_bytes()).unwrap();
        assert_eq!(page.meta_str("title"), Some("Intro"));
        assert_eq!(page.meta["tags"], serde_json::json!(["a", "b"]));
        assert_eq!(page.content, "# Hello\n");
    }

    #[test]
    fn test_decode_without_front_matter() {
        let page = FrontmatterSerialiser.decode("/plain.md", b"just text").unwrap();
        assert!(page.meta.is_empty());
        assert_eq!(page.content, "just text");
    }

    #[test]
    fn test_decode_unterminated() {
        assert!(FrontmatterSerialiser.decode("/bad.mdx", b"+++\ntitle = \"x\"\n").is_err());
    }

    #[test]
    fn test_encode_then_decode() {
        let page = Page::new("/a.mdx").with_meta("title", "A").with_content("Body\n");
        let bytes = FrontmatterSerialiser.encode(&page).unwrap();
        assert_eq!(FrontmatterSerialiser.decode("/a.mdx", &bytes).unwrap(), page);
    }

    #[test]
    fn test_encode_without_meta_is_plain() {
        let page = Page::new("/a.mdx").with_content("Body");
        assert_eq!(FrontmatterSerialiser.encode(&page).unwrap(), b"Body");
    }
}
