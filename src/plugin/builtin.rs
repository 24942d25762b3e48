//! Built-in plugins that every pipeline carries.
//!
//! `codemod` runs first so later plugins see fixed-up pages; `alias` and `ref`
//! run last so they see the final meta of every other plugin.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::hooks::{HookAction, HookPoint, PageContext, Plugin};
use super::pipeline::PluginEntry;
use crate::fs::path::{file_stem, normalize_path};
use crate::page::Page;

pub const CODEMOD: &str = "codemod";
pub const TAG: &str = "tag";
pub const ALIAS: &str = "alias";
pub const REF: &str = "ref";

const AFTER_SOURCE: &[HookPoint] = &[HookPoint::AfterSource];

/// Entries appended to every pipeline, with their fixed priorities.
pub fn builtin_entries() -> Vec<PluginEntry> {
    vec![
        PluginEntry::new(TAG, 0.0, Arc::new(TagPlugin)),
        PluginEntry::new(CODEMOD, f64::INFINITY, Arc::new(CodeModPlugin)),
        PluginEntry::new(ALIAS, -1.0, Arc::new(AliasPlugin)),
        PluginEntry::new(REF, -1.0, Arc::new(RefPlugin)),
    ]
}

/// Fills in a missing `title` from the file stem.
#[derive(Debug, Default)]
pub struct CodeModPlugin;

#[async_trait]
impl Plugin for CodeModPlugin {
    fn hooks(&self) -> &[HookPoint] {
        AFTER_SOURCE
    }

    async fn handle(&self, _hook: HookPoint, ctx: &mut PageContext) -> anyhow::Result<HookAction> {
        let has_title = ctx.page.meta_str("title").is_some_and(|title| !title.trim().is_empty());
        if !has_title {
            let title = title_from_stem(file_stem(&ctx.page.path));
            ctx.page.meta.insert("title".to_string(), Value::String(title));
        }
        Ok(HookAction::Continue)
    }
}

fn title_from_stem(stem: &str) -> String {
    stem.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalises the `tags` meta array.
#[derive(Debug, Default)]
pub struct TagPlugin;

#[async_trait]
impl Plugin for TagPlugin {
    fn hooks(&self) -> &[HookPoint] {
        AFTER_SOURCE
    }

    async fn handle(&self, _hook: HookPoint, ctx: &mut PageContext) -> anyhow::Result<HookAction> {
        let Some(tags) = ctx.page.meta.get("tags") else {
            return Ok(HookAction::Continue);
        };
        let Value::Array(items) = tags else {
            anyhow::bail!("tags must be an array of strings");
        };

        let mut normalized = BTreeSet::new();
        for item in items {
            let tag = item.as_str().ok_or_else(|| anyhow::anyhow!("tag {} is not a string", item))?;
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() {
                normalized.insert(tag);
            }
        }

        let tags = normalized.into_iter().map(Value::String).collect();
        ctx.page.meta.insert("tags".to_string(), Value::Array(tags));
        Ok(HookAction::Continue)
    }
}

/// Derives a redirect page for each entry of the `aliases` meta array.
#[derive(Debug, Default)]
pub struct AliasPlugin;

#[async_trait]
impl Plugin for AliasPlugin {
    fn hooks(&self) -> &[HookPoint] {
        AFTER_SOURCE
    }

    async fn handle(&self, _hook: HookPoint, ctx: &mut PageContext) -> anyhow::Result<HookAction> {
        let aliases: Vec<String> = match ctx.page.meta.get("aliases") {
            Some(Value::Array(items)) => {
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            }
            Some(_) => anyhow::bail!("aliases must be an array of paths"),
            None => return Ok(HookAction::Continue),
        };

        for alias in aliases {
            let alias = normalize_path(&alias)?;
            if alias == ctx.page.path {
                continue;
            }
            let redirect = Page::new(alias).with_meta("alias_of", ctx.page.path.clone());
            ctx.derive(redirect);
        }
        Ok(HookAction::Continue)
    }
}

/// Resolves `{ "$ref": "/path#key" }` meta values through the union view.
#[derive(Debug, Default)]
pub struct RefPlugin;

#[async_trait]
impl Plugin for RefPlugin {
    fn hooks(&self) -> &[HookPoint] {
        AFTER_SOURCE
    }

    async fn handle(&self, _hook: HookPoint, ctx: &mut PageContext) -> anyhow::Result<HookAction> {
        let refs: Vec<(String, String)> = ctx
            .page
            .meta
            .iter()
            .filter_map(|(key, value)| ref_target(value).map(|target| (key.clone(), target)))
            .collect();

        for (key, target) in refs {
            let (path, field) = match target.split_once('#') {
                Some((path, field)) => (path.to_string(), Some(field.to_string())),
                None => (target.clone(), None),
            };

            let resolved = match ctx.read_page(&path).await {
                Ok(page) => match field {
                    Some(field) => page.meta.get(&field).cloned(),
                    None => Some(Value::Object(page.meta)),
                },
                Err(e) => {
                    debug!(page = %ctx.page.path, target = %target, error = %e, "Unresolved $ref");
                    None
                }
            };

            if let Some(value) = resolved {
                ctx.page.meta.insert(key, value);
            }
        }
        Ok(HookAction::Continue)
    }
}

fn ref_target(value: &Value) -> Option<String> {
    let object: &Map<String, Value> = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get("$ref").and_then(Value::as_str).map(str::to_string)
}
