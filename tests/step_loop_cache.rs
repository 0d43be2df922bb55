//! 步进循环 + 文件缓存：第一次运行录制，第二个缓存实例从磁盘回放

use std::sync::Arc;

use pilot::agent::{RunOptions, StepEvent, StepLoop, StepLoopConfig};
use pilot::browser::mock::FakeBrowser;
use pilot::cache::{open_file_storage, AgentCache, CacheMode};
use pilot::config::CacheSettings;
use pilot::llm::{Generation, ScriptedLlmClient, ToolCall};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn script() -> Vec<Result<Generation, pilot::llm::LlmError>> {
    vec![
        Ok(Generation::tool_calls(vec![ToolCall::new(
            "c1",
            "type",
            json!({"text": "rust async"}),
        )])),
        Ok(Generation::tool_calls(vec![ToolCall::new(
            "c2",
            "done",
            json!({"success": true, "reasoning": "Typed the query"}),
        )])),
    ]
}

#[tokio::test]
async fn test_file_cache_replays_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let instruction = "type rust async into the search box";

    let storage = open_file_storage(dir.path()).await;
    let cache = Arc::new(AgentCache::new(storage, CacheMode::Persist));
    let llm = Arc::new(ScriptedLlmClient::new(script()));
    let browser = Arc::new(FakeBrowser::new("https://search.test"));
    let recorded = StepLoop::new(llm, browser, StepLoopConfig::default())
        .with_cache(cache)
        .run(RunOptions::new(instruction), &CancellationToken::new())
        .await
        .unwrap();
    assert!(recorded.completed);
    assert!(std::fs::read_dir(dir.path()).unwrap().count() >= 1);

    // 新实例，只共享磁盘目录；按 [cache] 配置构造
    let settings = CacheSettings {
        dir: Some(dir.path().to_path_buf()),
        mode: CacheMode::Persist,
    };
    let cache = Arc::new(AgentCache::from_settings(&settings).await);
    let llm = Arc::new(ScriptedLlmClient::new(Vec::new()));
    let browser = Arc::new(FakeBrowser::new("https://search.test"));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let replayed = StepLoop::new(llm.clone(), browser.clone(), StepLoopConfig::default())
        .with_cache(cache)
        .with_event_tx(tx)
        .run(RunOptions::new(instruction), &CancellationToken::new())
        .await
        .unwrap();

    assert!(replayed.success);
    assert!(replayed.completed);
    assert_eq!(replayed.message, recorded.message);
    assert!(llm.calls().is_empty());
    assert_eq!(browser.ops().len(), 1);

    let mut saw_hit = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, StepEvent::CacheHit { .. }) {
            saw_hit = true;
        }
    }
    assert!(saw_hit);
}

#[tokio::test]
async fn test_different_start_url_misses_cache() {
    let dir = tempfile::tempdir().unwrap();
    let instruction = "type rust async into the search box";

    let storage = open_file_storage(dir.path()).await;
    let cache = Arc::new(AgentCache::new(storage, CacheMode::Persist));
    StepLoop::new(
        Arc::new(ScriptedLlmClient::new(script())),
        Arc::new(FakeBrowser::new("https://search.test")),
        StepLoopConfig::default(),
    )
    .with_cache(cache.clone())
    .run(RunOptions::new(instruction), &CancellationToken::new())
    .await
    .unwrap();

    let llm = Arc::new(ScriptedLlmClient::new(script()));
    let result = StepLoop::new(
        llm.clone(),
        Arc::new(FakeBrowser::new("https://other.test")),
        StepLoopConfig::default(),
    )
    .with_cache(cache)
    .run(RunOptions::new(instruction), &CancellationToken::new())
    .await
    .unwrap();
    assert!(result.completed);
    assert_eq!(llm.calls().len(), 2);
}
