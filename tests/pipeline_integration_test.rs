//! Plugin pipeline integration tests - Test ordering with built-ins and dispatch

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use docweave::layer::UnionView;
use docweave::page::{Page, PageReader, PageRules};
use docweave::plugin::{
    ALIAS, CODEMOD, HookAction, HookPoint, PageContext, Plugin, PluginDispatchError, PluginEntry,
    PluginPipeline, REF, TAG, builtin_entries,
};
use docweave::serialiser::SerialiserSet;
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug)]
struct Noop;

#[async_trait]
impl Plugin for Noop {
    fn hooks(&self) -> &[HookPoint] {
        &[HookPoint::AfterSource]
    }

    async fn handle(
        &self,
        _hook: HookPoint,
        _ctx: &mut PageContext,
    ) -> anyhow::Result<HookAction> {
        Ok(HookAction::Continue)
    }
}

#[derive(Debug)]
struct Hang;

#[async_trait]
impl Plugin for Hang {
    fn hooks(&self) -> &[HookPoint] {
        &[HookPoint::AfterSource]
    }

    async fn handle(
        &self,
        _hook: HookPoint,
        ctx: &mut PageContext,
    ) -> anyhow::Result<HookAction> {
        ctx.page.content = "half-written".to_string();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(HookAction::Continue)
    }
}

fn context(page: Page) -> PageContext {
    let reader = PageReader::new(
        Arc::new(UnionView::new()),
        Arc::new(SerialiserSet::new()),
        Arc::new(PageRules::new(&[".mdx".to_string()], &[])),
    );
    PageContext::new("test", page, reader)
}

#[tokio::test]
async fn test_user_plugin_sits_between_builtins() -> Result<()> {
    let pipeline = PluginPipeline::new(builtin_entries());
    pipeline.register(PluginEntry::new("x", 5.0, Arc::new(Noop))).await;

    assert_eq!(pipeline.order().await, vec![CODEMOD, "x", TAG, ALIAS, REF]);
    Ok(())
}

#[tokio::test]
async fn test_compile_is_deterministic() -> Result<()> {
    let pipeline = PluginPipeline::new(builtin_entries());
    for (id, priority) in [("a", 0.0), ("b", -1.0), ("c", 0.0), ("d", f64::INFINITY)] {
        pipeline.register(PluginEntry::new(id, priority, Arc::new(Noop))).await;
    }

    let first = pipeline.order().await;
    let second = pipeline.order().await;
    assert_eq!(first, second);
    assert_eq!(first, vec!["d", CODEMOD, "a", "c", TAG, "b", ALIAS, REF]);
    Ok(())
}

#[tokio::test]
async fn test_builtins_transform_page() -> Result<()> {
    let pipeline = PluginPipeline::new(builtin_entries());
    let page = Page::new("/getting-started.mdx")
        .with_meta("tags", json!(["Setup", "setup "]))
        .with_meta("aliases", json!(["/start.mdx"]));
    let mut ctx = context(page);

    let result = pipeline.dispatch(HookPoint::AfterSource, &mut ctx).await;
    assert!(result.errors.is_empty());
    assert_eq!(result.ran, vec![CODEMOD, TAG, ALIAS, REF]);
    assert_eq!(ctx.page.meta_str("title"), Some("Getting Started"));
    assert_eq!(ctx.page.meta["tags"], json!(["setup"]));
    assert_eq!(ctx.derived()[0].path, "/start.mdx");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hung_plugin_times_out_and_rolls_back() -> Result<()> {
    let pipeline = PluginPipeline::new(vec![]);
    pipeline.register(PluginEntry::new("hang", 1.0, Arc::new(Hang))).await;
    pipeline.register(PluginEntry::new("after", 0.0, Arc::new(Noop))).await;
    let mut ctx = context(Page::new("/a.mdx").with_content("original"));

    let result = pipeline.dispatch(HookPoint::AfterSource, &mut ctx).await;
    assert_eq!(ctx.page.content, "original");
    assert_eq!(result.ran, vec!["after"]);
    assert!(matches!(result.errors[0], PluginDispatchError::TimedOut { .. }));
    Ok(())
}

proptest! {
    #[test]
    fn prop_builtins_bracket_user_plugins_above_minus_one(
        priorities in proptest::collection::vec(-0.5f64..1000.0, 0..12)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let order = runtime.block_on(async {
            let pipeline = PluginPipeline::new(builtin_entries());
            for (index, priority) in priorities.iter().enumerate() {
                let entry = PluginEntry::new(format!("user-{index}"), *priority, Arc::new(Noop));
                pipeline.register(entry).await;
            }
            pipeline.order().await
        });

        prop_assert_eq!(order.len(), priorities.len() + 4);
        prop_assert_eq!(order[0].as_str(), CODEMOD);
        let tail: Vec<&str> = order.iter().rev().take(2).map(String::as_str).collect();
        prop_assert_eq!(tail, vec![REF, ALIAS]);
    }

    #[test]
    fn prop_equal_priorities_keep_registration_order(count in 1usize..10) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let order = runtime.block_on(async {
            let pipeline = PluginPipeline::new(vec![]);
            for index in 0..count {
                let entry = PluginEntry::new(format!("p{index}"), 0.0, Arc::new(Noop));
                pipeline.register(entry).await;
            }
            pipeline.order().await
        });

        let expected: Vec<String> = (0..count).map(|index| format!("p{index}")).collect();
        prop_assert_eq!(order, expected);
    }
}
