//! SourceManager integration tests - Test source lifecycle against the union view

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use docweave::config::{Config, ConfigValidationError, SerialiserDefinition, SourceDefinition};
use docweave::layer::{ChangeKind, UnionView};
use docweave::manager::{ManagerError, SourceManager};
use docweave::plugin::{HookAction, HookPoint, PageContext, Plugin};
use docweave::registry::ModuleRegistry;
use docweave::source::{
    ContentSource, SourceError, SourceEvent, SourceFile, SourceSender, SourceState,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Scripted {
    initial: Vec<SourceFile>,
    fail_start: bool,
    hang: bool,
    linger: Duration,
    sender: Mutex<Option<SourceSender>>,
    workflow_runs: AtomicUsize,
}

impl Scripted {
    fn with_files(files: &[(&str, &str)]) -> Arc<Self> {
        let initial = files.iter().map(|(path, data)| SourceFile::new(*path, *data)).collect();
        Arc::new(Self { initial, ..Default::default() })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self { fail_start: true, ..Default::default() })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self { hang: true, ..Default::default() })
    }

    fn sender(&self) -> SourceSender {
        self.sender.lock().unwrap().clone().expect("source was started")
    }
}

#[async_trait]
impl ContentSource for Scripted {
    async fn start(&self, tx: SourceSender) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("remote unreachable");
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        *self.sender.lock().unwrap() = Some(tx.clone());
        tx.files(self.initial.clone()).await?;
        tokio::time::sleep(self.linger).await;
        Ok(())
    }

    fn workflows(&self) -> Vec<String> {
        vec!["rebuild".to_string()]
    }

    async fn run_workflow(
        &self,
        _name: &str,
        _path: &str,
        _data: Value,
        _tx: &SourceSender,
    ) -> anyhow::Result<()> {
        self.workflow_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry(scripts: &[(&str, Arc<Scripted>)]) -> ModuleRegistry {
    let scripts: Arc<HashMap<String, Arc<Scripted>>> =
        Arc::new(scripts.iter().map(|(name, script)| (name.to_string(), script.clone())).collect());
    let mut registry = ModuleRegistry::with_builtins();
    registry.register_source("scripted", move |name, _| {
        let script = scripts.get(name).cloned();
        let script = script.ok_or_else(|| anyhow::anyhow!("no script for {}", name))?;
        Ok(script as Arc<dyn ContentSource>)
    });
    registry
}

fn definition(name: &str) -> SourceDefinition {
    SourceDefinition {
        name: name.to_string(),
        module: "scripted".to_string(),
        options: Value::Null,
        disabled: false,
    }
}

fn config_for(names: &[&str]) -> Config {
    Config {
        sources: names.iter().map(|name| definition(name)).collect(),
        serialisers: vec![SerialiserDefinition {
            module: "frontmatter".to_string(),
            filter: r"\.mdx$".to_string(),
            options: Value::Null,
        }],
        ..Default::default()
    }
}

async fn wait_for_path(view: &UnionView, path: &str, present: bool) {
    for _ in 0..200 {
        if view.file_exists(path).await == present {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never became present={}", path, present);
}

#[tokio::test]
async fn test_first_source_wins_on_conflict() -> Result<()> {
    let a = Scripted::with_files(&[("/readme.mdx", "from a")]);
    let b = Scripted::with_files(&[("/readme.mdx", "from b"), ("/b-marker.txt", "b")]);
    let manager =
        SourceManager::from_config(config_for(&["a", "b"]), registry(&[("a", a), ("b", b)]))?;

    assert_eq!(manager.start().await?, 2);
    wait_for_path(manager.filesystem(), "/b-marker.txt", true).await;

    let page = manager.read_page("/readme.mdx").await?;
    assert_eq!(page.content, "from a");
    assert_eq!(page.meta_str("title"), Some("Readme"));

    let sources = manager.sources().await;
    let b = sources.iter().find(|source| source.name() == "b").expect("b is live");
    let b_layer = b.layer().read("/readme.mdx").await?;
    assert!(String::from_utf8(b_layer)?.ends_with("from b"));

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_ignored_pages_are_listable_but_not_pages() -> Result<()> {
    let index = "+++\nowner = { \"$ref\" = \"/draft.mdx#lead\" }\n+++\nHome";
    let draft = "+++\nlead = \"sam\"\n+++\nWIP";
    let docs = Scripted::with_files(&[("/draft.mdx", draft), ("/index.mdx", index)]);
    let mut config = config_for(&["docs"]);
    config.ignore_pages = vec!["draft.mdx".to_string()];
    let manager = SourceManager::from_config(config, registry(&[("docs", docs)]))?;

    manager.start().await?;
    wait_for_path(manager.filesystem(), "/index.mdx", true).await;

    assert!(manager.is_page("/index.mdx"));
    assert!(!manager.is_page("/draft.mdx"));
    assert_eq!(manager.filesystem().list("/").await?, vec!["/draft.mdx", "/index.mdx"]);
    assert_eq!(manager.filesystem().read("/draft.mdx").await?, draft.as_bytes());
    assert!(manager.read_page("/draft.mdx").await.is_err());

    let page = manager.read_page("/index.mdx").await?;
    assert_eq!(page.meta["owner"], json!({"$ref": "/draft.mdx#lead"}));

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_error_then_exit_detaches_layer() -> Result<()> {
    let a = Scripted::with_files(&[("/a-only.txt", "a")]);
    let b = Scripted::with_files(&[("/b.txt", "b")]);
    let manager = SourceManager::from_config(
        config_for(&["a", "b"]),
        registry(&[("a", a.clone()), ("b", b.clone())]),
    )?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let _subscription = manager.on_source_event(move |event| {
        let _ = tx.send(event);
    });

    manager.start().await?;
    wait_for_path(manager.filesystem(), "/a-only.txt", true).await;
    wait_for_path(manager.filesystem(), "/b.txt", true).await;

    a.sender().error("upstream 503").await?;
    a.sender().exit(Some("repository deleted".to_string())).await?;

    let first = tokio::time::timeout(Duration::from_secs(1), events.recv()).await?.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), events.recv()).await?.unwrap();
    assert!(matches!(first, SourceEvent::Error { ref name, .. } if name == "a"));
    assert!(matches!(second, SourceEvent::Exit { ref name, .. } if name == "a"));

    assert!(manager.filesystem().read("/a-only.txt").await.unwrap_err().is_not_found());
    assert_eq!(manager.filesystem().read("/b.txt").await?, b"b");
    let remaining = manager.sources().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name(), "b");
    assert_eq!(remaining[0].state().await, SourceState::Running);
    assert_eq!(manager.metrics().layers_mounted.get(), 1.0);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_errors_keep_content_available() -> Result<()> {
    let a = Scripted::with_files(&[("/a.txt", "a")]);
    let manager = SourceManager::from_config(config_for(&["a"]), registry(&[("a", a.clone())]))?;

    let (tx, mut errors) = mpsc::unbounded_channel();
    let _subscription = manager.on_source_error(move |event| {
        let _ = tx.send(event);
    });

    manager.start().await?;
    wait_for_path(manager.filesystem(), "/a.txt", true).await;
    a.sender().error("flaky").await?;

    let event = tokio::time::timeout(Duration::from_secs(1), errors.recv()).await?.unwrap();
    assert!(matches!(event, SourceEvent::Error { .. }));
    assert_eq!(manager.sources().await[0].state().await, SourceState::Errored);
    assert_eq!(manager.filesystem().read("/a.txt").await?, b"a");

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_workflow_leaves_state_unchanged() -> Result<()> {
    let a = Scripted::with_files(&[]);
    let b = Scripted::with_files(&[]);
    let manager = SourceManager::from_config(
        config_for(&["a", "b"]),
        registry(&[("a", a.clone()), ("b", b.clone())]),
    )?;
    manager.start().await?;

    let err = manager.trigger_workflow("deploy", "/", Value::Null).await.unwrap_err();
    assert!(err.is_workflow_not_found());
    for source in manager.sources().await {
        assert_eq!(source.state().await, SourceState::Running);
    }

    manager.trigger_workflow("rebuild", "/", Value::Null).await?;
    assert_eq!(a.workflow_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b.workflow_runs.load(Ordering::SeqCst), 1);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_workflow_routed_to_target() -> Result<()> {
    let a = Scripted::with_files(&[]);
    let b = Scripted::with_files(&[]);
    let mut config = config_for(&["a", "b"]);
    config.workflow_target = Some("b".to_string());
    let manager =
        SourceManager::from_config(config, registry(&[("a", a.clone()), ("b", b.clone())]))?;
    manager.start().await?;

    manager.trigger_workflow("rebuild", "/docs", json!({"force": true})).await?;
    assert_eq!(a.workflow_runs.load(Ordering::SeqCst), 0);
    assert_eq!(b.workflow_runs.load(Ordering::SeqCst), 1);

    let err = manager.trigger_workflow("deploy", "/", Value::Null).await.unwrap_err();
    assert!(err.is_workflow_not_found());

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_disabled_and_failing_sources() -> Result<()> {
    let mut config = config_for(&["ok", "broken", "off"]);
    config.sources[2].disabled = true;
    let manager = SourceManager::from_config(
        config,
        registry(&[
            ("ok", Scripted::with_files(&[])),
            ("broken", Scripted::failing()),
            ("off", Scripted::with_files(&[])),
        ]),
    )?;

    assert_eq!(manager.start().await?, 1);
    assert_eq!(manager.filesystem().layer_count().await, 1);

    let mut disabled = definition("off");
    disabled.disabled = true;
    let err = manager.add_source(&disabled).await.unwrap_err();
    assert!(matches!(err, ManagerError::Source(SourceError::Disabled(_))));

    let err = manager.add_source(&definition("broken")).await.unwrap_err();
    assert!(matches!(err, ManagerError::Source(SourceError::Init { .. })));
    assert_eq!(manager.filesystem().layer_count().await, 1);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_source_is_idempotent() -> Result<()> {
    let a = Scripted::with_files(&[("/a.txt", "a")]);
    let manager = SourceManager::from_config(config_for(&["a"]), registry(&[("a", a)]))?;
    manager.start().await?;
    wait_for_path(manager.filesystem(), "/a.txt", true).await;

    let source = manager.sources().await.remove(0);
    manager.stop_source(source.id()).await?;
    manager.stop_source(source.id()).await?;

    assert_eq!(source.state().await, SourceState::Exited);
    assert_eq!(manager.filesystem().layer_count().await, 0);
    assert!(manager.source(source.id()).await.is_none());

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_destroy_all_settles_every_source() -> Result<()> {
    let manager = SourceManager::from_config(
        config_for(&["a", "b", "c"]),
        registry(&[
            ("a", Scripted::with_files(&[("/a.txt", "a")])),
            ("b", Scripted::with_files(&[("/b.txt", "b")])),
            ("c", Scripted::with_files(&[("/c.txt", "c")])),
        ]),
    )?;
    manager.start().await?;
    let sources = manager.sources().await;
    assert_eq!(sources.len(), 3);

    manager.destroy_all().await?;

    assert!(manager.sources().await.is_empty());
    assert_eq!(manager.filesystem().layer_count().await, 0);
    for source in sources {
        assert_eq!(source.state().await, SourceState::Exited);
    }
    manager.destroy_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_update_subscription_and_unsubscribe() -> Result<()> {
    let a = Scripted::with_files(&[("/first.txt", "1")]);
    let manager = SourceManager::from_config(config_for(&["a"]), registry(&[("a", a.clone())]))?;

    let (tx, mut updates) = mpsc::unbounded_channel();
    let subscription = manager.on_source_update(move |update| {
        let _ = tx.send(update);
    });
    manager.start().await?;

    let update = tokio::time::timeout(Duration::from_secs(1), updates.recv()).await?.unwrap();
    assert_eq!(update.source, "a");
    assert_eq!(update.path, "/first.txt");
    assert_eq!(update.kind, ChangeKind::Added);

    subscription.unsubscribe();
    a.sender().files(vec![SourceFile::new("/second.txt", "2")]).await?;
    wait_for_path(manager.filesystem(), "/second.txt", true).await;

    let late = tokio::time::timeout(Duration::from_millis(50), updates.recv()).await;
    assert!(!matches!(late, Ok(Some(_))));

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_removed_files_leave_the_view() -> Result<()> {
    let a = Scripted::with_files(&[("/guide.mdx", "text"), ("/logo.svg", "<svg/>")]);
    let manager = SourceManager::from_config(config_for(&["a"]), registry(&[("a", a.clone())]))?;
    manager.start().await?;
    wait_for_path(manager.filesystem(), "/logo.svg", true).await;

    a.sender().removed(vec!["/guide.mdx".to_string(), "/never-existed.mdx".to_string()]).await?;
    wait_for_path(manager.filesystem(), "/guide.mdx", false).await;
    assert!(manager.filesystem().file_exists("/logo.svg").await);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_aborts_construction() -> Result<()> {
    let err = SourceManager::from_config(Config::default(), ModuleRegistry::with_builtins())
        .unwrap_err();
    assert!(matches!(err, ManagerError::Config(ConfigValidationError::NoSources)));

    let mut config = config_for(&["a"]);
    config.sources[0].module = "git".to_string();
    let manager = SourceManager::from_config(config, ModuleRegistry::with_builtins())?;
    let err = manager.add_source(&manager.config().sources[0].clone()).await.unwrap_err();
    assert!(matches!(err, ManagerError::Registry(_)));

    let mut config = config_for(&["a"]);
    config.plugins.push(docweave::config::PluginDefinition {
        module: "spellcheck".to_string(),
        options: Value::Null,
        priority: 0.0,
        disabled: false,
    });
    let err = SourceManager::from_config(config, ModuleRegistry::with_builtins()).unwrap_err();
    assert!(matches!(err, ManagerError::Registry(_)));
    Ok(())
}

#[tokio::test]
async fn test_compiled_plugins_include_configured_entries() -> Result<()> {
    let mut config = config_for(&["a"]);
    config.plugins.push(docweave::config::PluginDefinition {
        module: "tag".to_string(),
        options: Value::Null,
        priority: 5.0,
        disabled: false,
    });
    let manager = SourceManager::from_config(config, ModuleRegistry::with_builtins())?;

    assert_eq!(manager.compiled_plugins().await, vec!["codemod", "tag", "tag", "alias", "ref"]);
    Ok(())
}

#[tokio::test]
async fn test_hung_source_does_not_block_others() -> Result<()> {
    let slow = Scripted::hanging();
    let fast = Scripted::with_files(&[("/fast.txt", "fast")]);
    let manager = Arc::new(SourceManager::from_config(
        config_for(&["slow", "fast"]),
        registry(&[("slow", slow), ("fast", fast)]),
    )?);

    let starting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.start().await }
    });

    wait_for_path(manager.filesystem(), "/fast.txt", true).await;
    let live: Vec<String> =
        manager.sources().await.iter().map(|source| source.name().to_string()).collect();
    assert_eq!(live, vec!["fast"]);
    assert!(!starting.is_finished());

    // A second start while the first is in flight is a no-op.
    assert_eq!(manager.start().await?, 0);

    starting.abort();
    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_precedence_follows_config_order_not_start_order() -> Result<()> {
    let a = Arc::new(Scripted {
        initial: vec![SourceFile::new("/readme.mdx", "from a")],
        linger: Duration::from_millis(100),
        ..Default::default()
    });
    let b = Scripted::with_files(&[("/readme.mdx", "from b")]);
    let manager =
        SourceManager::from_config(config_for(&["a", "b"]), registry(&[("a", a), ("b", b)]))?;

    assert_eq!(manager.start().await?, 2);
    wait_for_path(manager.filesystem(), "/readme.mdx", true).await;
    assert_eq!(manager.read_page("/readme.mdx").await?.content, "from a");

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_update_is_readable_when_delivered() -> Result<()> {
    let docs = Arc::new(Scripted {
        initial: vec![SourceFile::new("/a.txt", "early")],
        linger: Duration::from_millis(200),
        ..Default::default()
    });
    let manager =
        Arc::new(SourceManager::from_config(config_for(&["docs"]), registry(&[("docs", docs)]))?);
    let mut updates = manager.subscribe_updates();

    let starting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.start().await }
    });

    let update = tokio::time::timeout(Duration::from_secs(2), updates.recv()).await??;
    assert_eq!(update.path, "/a.txt");
    assert_eq!(manager.filesystem().read("/a.txt").await?, b"early");

    assert_eq!(starting.await??, 1);
    manager.stop().await?;
    Ok(())
}

/// Panics on one path, passes every other page through.
#[derive(Debug)]
struct Boom;

#[async_trait]
impl Plugin for Boom {
    fn hooks(&self) -> &[HookPoint] {
        &[HookPoint::AfterSource]
    }

    async fn handle(&self, _hook: HookPoint, ctx: &mut PageContext) -> anyhow::Result<HookAction> {
        if ctx.page.path == "/boom.mdx" {
            panic!("boom on {}", ctx.page.path);
        }
        Ok(HookAction::Continue)
    }
}

#[tokio::test]
async fn test_panicking_plugin_keeps_source_running() -> Result<()> {
    let docs = Scripted::with_files(&[("/boom.mdx", "x"), ("/ok.mdx", "fine")]);
    let mut registry = registry(&[("docs", docs.clone())]);
    registry.register_plugin("boom", |_| Ok(Arc::new(Boom) as Arc<dyn Plugin>));
    let mut config = config_for(&["docs"]);
    config.plugins.push(docweave::config::PluginDefinition {
        module: "boom".to_string(),
        options: Value::Null,
        priority: 1.0,
        disabled: false,
    });
    let manager = SourceManager::from_config(config, registry)?;

    assert_eq!(manager.start().await?, 1);
    wait_for_path(manager.filesystem(), "/ok.mdx", true).await;
    assert_eq!(manager.read_page("/ok.mdx").await?.content, "fine");

    docs.sender().files(vec![SourceFile::new("/later.txt", "later")]).await?;
    wait_for_path(manager.filesystem(), "/later.txt", true).await;

    let source = manager.sources().await.remove(0);
    assert_eq!(source.state().await, SourceState::Running);
    assert_eq!(manager.metrics().plugin_errors.with_label_values(&["boom"]).get(), 1.0);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_alias_pages_follow_their_page() -> Result<()> {
    let guide = |alias: &str| {
        let text = format!("+++\naliases = [\"{}\"]\n+++\nGuide", alias);
        vec![SourceFile::new("/guide.mdx", text)]
    };
    let docs = Arc::new(Scripted { initial: guide("/old.mdx"), ..Default::default() });
    let manager =
        SourceManager::from_config(config_for(&["docs"]), registry(&[("docs", docs.clone())]))?;
    manager.start().await?;
    wait_for_path(manager.filesystem(), "/old.mdx", true).await;

    docs.sender().files(guide("/new.mdx")).await?;
    wait_for_path(manager.filesystem(), "/new.mdx", true).await;
    wait_for_path(manager.filesystem(), "/old.mdx", false).await;
    assert_eq!(manager.read_page("/new.mdx").await?.meta_str("alias_of"), Some("/guide.mdx"));

    docs.sender().removed(vec!["/guide.mdx".to_string()]).await?;
    wait_for_path(manager.filesystem(), "/new.mdx", false).await;
    assert!(!manager.filesystem().file_exists("/guide.mdx").await);

    manager.stop().await?;
    Ok(())
}
