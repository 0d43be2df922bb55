//! 步进主循环
//!
//! Init -> AwaitingModel -> ExecutingTools -> (AwaitingModel | Completed | MaxStepsReached | Aborted | Failed)。
//! 每轮把对话、全部工具与保留的 done 工具交给模型；模型不再调用工具或步数用尽时由 DoneEnforcer 补一次判断。
//! 同一轮内的工具调用按声明顺序逐个执行；取消在每轮边界检查，并透传给进行中的推理调用。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    Action, ActionMapper, AgentResult, AgentState, CoordinateNormalizer, CoordinateSpace, DoneEnforcer,
    ReplayMapping, StepEvent, ViewportResolver,
};
use crate::browser::{with_timeout, BrowserSession, Viewport};
use crate::cache::{AgentCache, CacheEntry, CachedVerdict};
use crate::config::AgentSettings;
use crate::core::AgentError;
use crate::llm::{
    GenerateRequest, Generation, ImagePayload, LlmClient, LlmError, Message, TokenUsage, ToolCall,
    ToolChoice, UsageSink,
};
use crate::tools::{
    done_tool_spec, BrowserToolbox, BuiltinTool, DoneVerdict, ToolExecutor, ToolOutcome,
    ToolRegistry, DONE_TOOL,
};

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a browser automation agent. You see screenshots of \
the current page and act on it with the provided tools. Coordinates refer to the latest screenshot. \
Work step by step. When the task is finished, or you are certain it cannot be completed, call the \
`done` tool with your judgment.";

/// 循环所处状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    AwaitingModel,
    ExecutingTools,
    Completed,
    MaxStepsReached,
    Aborted,
    Failed,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Completed | LoopState::MaxStepsReached | LoopState::Aborted | LoopState::Failed
        )
    }
}

/// 循环配置
#[derive(Debug, Clone)]
pub struct StepLoopConfig {
    pub max_steps: u32,
    pub tool_timeout: Duration,
    pub screenshot_timeout: Option<Duration>,
    /// 输出 [0,1] 归一化坐标的模型名片段
    pub normalized_models: Vec<String>,
    pub viewports: ViewportResolver,
    pub system_prompt: Option<String>,
}

impl Default for StepLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            tool_timeout: Duration::from_secs(30),
            screenshot_timeout: Some(Duration::from_secs(10)),
            normalized_models: Vec::new(),
            viewports: ViewportResolver::default(),
            system_prompt: None,
        }
    }
}

impl StepLoopConfig {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            max_steps: settings.max_steps,
            tool_timeout: Duration::from_secs(settings.tool_timeout_secs),
            screenshot_timeout: settings.screenshot_timeout_ms.map(Duration::from_millis),
            normalized_models: settings.normalized_models.clone(),
            viewports: ViewportResolver::new(
                settings.stealth_viewport.map(|v| Viewport::new(v.width, v.height)),
                Viewport::new(settings.viewport.width, settings.viewport.height),
            ),
            system_prompt: settings.system_prompt.clone(),
        }
    }
}

/// 单次运行参数
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub instruction: String,
    /// 覆盖配置中的步数上限
    pub max_steps: Option<u32>,
    /// 结构化输出 schema，字段合并进 done 工具
    pub output_schema: Option<Value>,
}

impl RunOptions {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            max_steps: None,
            output_schema: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

pub struct StepLoop {
    llm: Arc<dyn LlmClient>,
    browser: Arc<dyn BrowserSession>,
    tools: ToolRegistry,
    config: StepLoopConfig,
    cache: Option<Arc<AgentCache>>,
    usage_sink: Option<UsageSink>,
    event_tx: Option<UnboundedSender<StepEvent>>,
}

/// 运行中的可变上下文，只在 run 内存在
struct Run<'a> {
    options: &'a RunOptions,
    state: AgentState,
    messages: Vec<Message>,
    usage: TokenUsage,
    verdict: Option<DoneVerdict>,
    loop_state: LoopState,
}

impl StepLoop {
    pub fn new(llm: Arc<dyn LlmClient>, browser: Arc<dyn BrowserSession>, config: StepLoopConfig) -> Self {
        Self {
            llm,
            browser,
            tools: ToolRegistry::new(),
            config,
            cache: None,
            usage_sink: None,
            event_tx: None,
        }
    }

    /// 调用方自定义工具
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cache(mut self, cache: Arc<AgentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_usage_sink(mut self, sink: UsageSink) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<StepEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: StepEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn add_usage(&self, run: &mut Run<'_>, usage: &TokenUsage) {
        run.usage += *usage;
        if let Some(sink) = &self.usage_sink {
            sink.record(usage);
        }
    }

    /// 截图失败或超时只记日志，不中断运行
    async fn capture(&self) -> Option<Vec<u8>> {
        match with_timeout(self.browser.screenshot(), self.config.screenshot_timeout, "screenshot").await {
            Ok(png) => {
                self.emit(StepEvent::Screenshot { bytes: png.len() });
                Some(png)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Screenshot capture failed, continuing without it");
                None
            }
        }
    }

    /// 执行一次运行
    ///
    /// 取消与配置错误以 Err 返回；其余失败均返回 success=false 的结果
    pub async fn run(
        &self,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentResult, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if options.instruction.trim().is_empty() {
            return Err(AgentError::Config("instruction must not be empty".to_string()));
        }
        let max_steps = options.max_steps.unwrap_or(self.config.max_steps);
        if max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".to_string()));
        }

        let capabilities = self.browser.capabilities();
        let start_url = self.browser.current_url().await;
        let cache_key = self.cache.as_ref().map(|_| {
            AgentCache::fingerprint(
                &options.instruction,
                &start_url,
                self.llm.model_name(),
                max_steps,
                options.output_schema.as_ref(),
            )
        });

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(entry) = cache.lookup(key).await {
                self.emit(StepEvent::CacheHit { key: key.clone() });
                match cache.replay(&entry, self.browser.as_ref()).await {
                    Ok(result) => {
                        self.emit(StepEvent::Finished {
                            success: result.success,
                            completed: result.completed,
                        });
                        return Ok(result);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Cached replay failed, falling back to a live run");
                    }
                }
            }
        }

        let locate = self
            .cache
            .as_ref()
            .map(|c| c.is_replay_active())
            .unwrap_or(false)
            && capabilities.element_locators;
        let space = CoordinateSpace::detect(
            self.llm.provider(),
            self.llm.model_name(),
            &self.config.normalized_models,
        );
        let toolbox = BrowserToolbox::new(
            self.browser.clone(),
            CoordinateNormalizer::new(space, self.config.viewports),
            locate,
        );
        let executor = ToolExecutor::with_timeout(self.config.tool_timeout);

        let mut tool_specs = BuiltinTool::all_specs();
        tool_specs.extend(self.tools.specs());
        tool_specs.push(done_tool_spec(options.output_schema.as_ref()));

        tracing::info!(
            model = self.llm.model_name(),
            max_steps,
            ?space,
            locate,
            "Starting agent run"
        );

        let mut run = Run {
            options: &options,
            state: AgentState::new(start_url.clone()),
            messages: Vec::new(),
            usage: TokenUsage::default(),
            verdict: None,
            loop_state: LoopState::Init,
        };
        let system_prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        run.messages.push(Message::system(system_prompt));
        let task = format!(
            "Task: {}\nCurrent URL: {}",
            options.instruction, run.state.current_page_url
        );
        match self.capture().await {
            Some(png) => run
                .messages
                .push(Message::user_with_images(task, vec![ImagePayload::png(&png)])),
            None => run.messages.push(Message::user(task)),
        }

        let mut step: u32 = 0;
        while !run.loop_state.is_terminal() {
            if cancel.is_cancelled() {
                run.loop_state = LoopState::Aborted;
                break;
            }
            if step >= max_steps {
                run.loop_state = LoopState::MaxStepsReached;
                break;
            }
            step += 1;
            self.emit(StepEvent::StepUpdate { step, max_steps });

            run.loop_state = LoopState::AwaitingModel;
            self.emit(StepEvent::Thinking);
            let request = GenerateRequest {
                messages: &run.messages,
                tools: &tool_specs,
                tool_choice: ToolChoice::Auto,
                stop_on_tool: Some(DONE_TOOL),
            };
            let generated: Result<Generation, LlmError> = tokio::select! {
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                result = self.llm.generate(request, cancel) => result,
            };
            let generation = match generated {
                Ok(g) => g,
                Err(LlmError::Cancelled) => {
                    run.loop_state = LoopState::Aborted;
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, step, "Model inference failed");
                    self.emit(StepEvent::Error { text: e.to_string() });
                    run.loop_state = LoopState::Failed;
                    let message = format!("Model inference failed: {}", e);
                    return Ok(self.finish_failed(run, message));
                }
            };
            self.add_usage(&mut run, &generation.usage);

            for text in [&generation.reasoning, &generation.text].into_iter().flatten() {
                if !text.trim().is_empty() {
                    run.state.collected_reasoning.push(text.clone());
                    self.emit(StepEvent::Reasoning { text: text.clone() });
                }
            }

            if generation.tool_calls.is_empty() {
                run.state.final_message = generation.text.clone();
                run.messages
                    .push(Message::assistant(generation.text.clone(), Vec::new()));
                run.loop_state = LoopState::Completed;
                break;
            }

            run.loop_state = LoopState::ExecutingTools;
            run.messages.push(Message::assistant(
                generation.text.clone(),
                generation.tool_calls.clone(),
            ));
            let done_fired = self
                .execute_turn(&mut run, &toolbox, &executor, &generation.tool_calls)
                .await;

            if done_fired {
                run.loop_state = LoopState::Completed;
            } else if let Some(png) = self.capture().await {
                let note = format!(
                    "Screenshot after the actions above. Current URL: {}",
                    run.state.current_page_url
                );
                run.messages
                    .push(Message::user_with_images(note, vec![ImagePayload::png(&png)]));
            }
        }

        if run.loop_state == LoopState::Aborted {
            tracing::info!(step, "Run cancelled");
            self.emit(StepEvent::Error {
                text: "cancelled".to_string(),
            });
            return Err(AgentError::Cancelled);
        }

        if run.verdict.is_none() {
            if run.loop_state == LoopState::MaxStepsReached {
                tracing::info!(max_steps, "Step budget exhausted without done");
            }
            self.force_done(&mut run, cancel).await?;
        }

        let (result, replay) = self.finish(run);
        if let (Some(cache), Some(key), Some(steps)) = (&self.cache, cache_key, replay) {
            let entry = CacheEntry::new(&options.instruction, key, start_url, steps).with_verdict(
                CachedVerdict {
                    success: result.success,
                    reasoning: result.message.clone(),
                    output: result.output.clone(),
                },
            );
            if let Err(e) = cache.store(entry).await {
                tracing::warn!(error = %e, "Failed to store replay entry");
            }
        }
        Ok(result)
    }

    /// 逐个执行本轮的工具调用；返回本轮是否已触发 done
    async fn execute_turn(
        &self,
        run: &mut Run<'_>,
        toolbox: &BrowserToolbox,
        executor: &ToolExecutor,
        calls: &[ToolCall],
    ) -> bool {
        let media_inline = self.llm.supports_media_in_tool_results();
        let collect_output = run.options.output_schema.is_some();
        let mut done_fired = false;
        let mut detached_images: Vec<ImagePayload> = Vec::new();

        for call in calls {
            if done_fired {
                // done 之后同一轮的调用不再执行，但保留 tool 结果以维持对话配对
                run.messages.push(Message::tool_result(
                    &call.id,
                    &json!({ "skipped": "the task was already marked done" }),
                    Vec::new(),
                ));
                continue;
            }
            self.emit(StepEvent::ToolCall {
                tool: call.name.clone(),
                args: call.arguments.clone(),
            });
            let timestamp = chrono::Utc::now().timestamp_millis();

            if call.name == DONE_TOOL {
                let verdict = DoneVerdict::from_args(&call.arguments, collect_output);
                let outcome = ToolOutcome::ok(json!({ "success": true, "acknowledged": true }));
                run.state.actions.extend(ActionMapper::map(
                    DONE_TOOL,
                    &call.arguments,
                    &outcome,
                    &run.state.current_page_url,
                    timestamp,
                ));
                run.messages
                    .push(Message::tool_result(&call.id, &outcome.output, Vec::new()));
                tracing::info!(success = verdict.success, "Model called done");
                run.verdict = Some(verdict);
                done_fired = true;
                continue;
            }

            let outcome = self.execute_tool(toolbox, executor, call).await;
            if outcome.success {
                self.emit(StepEvent::ToolResult {
                    tool: call.name.clone(),
                    preview: preview(&outcome.output),
                });
            } else {
                let reason = outcome
                    .output
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                tracing::warn!(tool = %call.name, reason = %reason, "Tool failed, reporting back to model");
                self.emit(StepEvent::ToolFailure {
                    tool: call.name.clone(),
                    reason,
                });
            }

            run.state.actions.extend(ActionMapper::map(
                &call.name,
                &call.arguments,
                &outcome,
                &run.state.current_page_url,
                timestamp,
            ));
            if toolbox.locate() && run.state.replayable {
                match ActionMapper::replay_action(&call.name, &call.arguments, &outcome) {
                    ReplayMapping::Step(action) => run.state.replay_steps.push(action),
                    ReplayMapping::NotApplicable => {}
                    ReplayMapping::Unreplayable(reason) => {
                        tracing::debug!(reason = %reason, "Run is no longer replayable");
                        run.state.replayable = false;
                    }
                }
            }
            run.state.current_page_url = self.browser.current_url().await;

            if media_inline {
                run.messages
                    .push(Message::tool_result(&call.id, &outcome.output, outcome.images));
            } else {
                run.messages
                    .push(Message::tool_result(&call.id, &outcome.output, Vec::new()));
                detached_images.extend(outcome.images);
            }
        }

        if !detached_images.is_empty() {
            run.messages.push(Message::user_with_images(
                "Images returned by the tool calls above.",
                detached_images,
            ));
        }
        done_fired
    }

    /// 工具错误转为结构化错误负载，不中断运行
    async fn execute_tool(
        &self,
        toolbox: &BrowserToolbox,
        executor: &ToolExecutor,
        call: &ToolCall,
    ) -> ToolOutcome {
        let result = if let Some(builtin) = BuiltinTool::from_name(&call.name) {
            executor
                .execute(&call.name, &call.arguments, toolbox.execute(builtin, &call.arguments))
                .await
        } else if let Some(tool) = self.tools.get(&call.name) {
            executor
                .execute(&call.name, &call.arguments, tool.execute(call.arguments.clone()))
                .await
                .map(ToolOutcome::ok)
        } else {
            return ToolOutcome::failed(format!("Unknown tool: {}", call.name));
        };
        result.unwrap_or_else(|e| ToolOutcome::failed(e.to_string()))
    }

    async fn force_done(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.emit(StepEvent::DoneForced);
        let enforcer = DoneEnforcer::new(self.llm.as_ref(), run.options.output_schema.as_ref());
        let forced = match enforcer
            .enforce(&run.options.instruction, &run.messages, cancel)
            .await
        {
            Ok(forced) => forced,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Forced completion judgment failed");
                self.emit(StepEvent::Error { text: e.to_string() });
                return Ok(());
            }
        };
        self.add_usage(run, &forced.generation.usage);

        if let Some((call, verdict)) = forced.call {
            let outcome = ToolOutcome::ok(json!({ "success": true, "acknowledged": true }));
            run.state.actions.extend(ActionMapper::map(
                DONE_TOOL,
                &call.arguments,
                &outcome,
                &run.state.current_page_url,
                chrono::Utc::now().timestamp_millis(),
            ));
            run.messages.push(Message::assistant(
                forced.generation.text.clone(),
                vec![call.clone()],
            ));
            run.messages
                .push(Message::tool_result(&call.id, &outcome.output, Vec::new()));
            run.verdict = Some(verdict);
        }
        Ok(())
    }

    /// 组装结果；第二项为可缓存的回放序列
    fn finish(&self, run: Run<'_>) -> (AgentResult, Option<Vec<Action>>) {
        let Run {
            mut state,
            messages,
            usage,
            verdict,
            ..
        } = run;

        let (completed, output) = match &verdict {
            Some(v) => (v.success, v.output.clone()),
            None => (false, None),
        };
        if completed {
            state.mark_completed();
        }
        let message = verdict
            .as_ref()
            .map(|v| v.reasoning.clone())
            .filter(|r| !r.trim().is_empty())
            .or_else(|| state.final_message.clone().filter(|m| !m.trim().is_empty()))
            .or_else(|| state.collected_reasoning.last().cloned())
            .unwrap_or_else(|| {
                if completed {
                    "Task completed".to_string()
                } else {
                    "Task was not completed".to_string()
                }
            });

        let replay = if state.is_completed() && state.replayable && !state.replay_steps.is_empty() {
            Some(std::mem::take(&mut state.replay_steps))
        } else {
            None
        };

        tracing::info!(
            completed,
            actions = state.actions.len(),
            total_tokens = usage.total_tokens(),
            "Agent run finished"
        );
        self.emit(StepEvent::Finished {
            success: completed,
            completed,
        });
        let result = AgentResult {
            success: completed,
            message,
            completed: state.is_completed(),
            actions: state.actions,
            usage,
            messages,
            output,
        };
        (result, replay)
    }

    fn finish_failed(&self, run: Run<'_>, message: String) -> AgentResult {
        self.emit(StepEvent::Finished {
            success: false,
            completed: false,
        });
        AgentResult::failed(message, run.state, run.usage, run.messages)
    }
}

fn preview(value: &Value) -> String {
    let s = value.to_string();
    if s.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", s.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::FakeBrowser;
    use crate::cache::{CacheMode, InMemoryCacheStorage};
    use crate::llm::{ModelProvider, ScriptedLlmClient};
    use crate::tools::Tool;
    use async_trait::async_trait;

    fn click(id: &str, x: i64, y: i64) -> Generation {
        Generation::tool_calls(vec![ToolCall::new(id, "click", json!({"x": x, "y": y}))])
    }

    fn done(id: &str, success: bool) -> Generation {
        Generation::tool_calls(vec![ToolCall::new(
            id,
            "done",
            json!({"success": success, "reasoning": "Clicked the Login button"}),
        )])
    }

    fn step_loop(llm: Arc<ScriptedLlmClient>, browser: Arc<FakeBrowser>) -> StepLoop {
        StepLoop::new(llm, browser, StepLoopConfig::default())
    }

    #[tokio::test]
    async fn test_click_then_done() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(click("c1", 500, 500)), Ok(done("c2", true))]));
        let browser = Arc::new(FakeBrowser::new("https://app.test/login"));
        let result = step_loop(llm.clone(), browser.clone())
            .run(
                RunOptions::new("click the Login button").with_max_steps(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.completed);
        let kinds: Vec<&str> = result.actions.iter().map(|a| a.action_type.as_str()).collect();
        assert_eq!(kinds, vec!["click", "done"]);
        assert!(!result.message.is_empty());
        assert_eq!(llm.calls().len(), 2);
        // 默认像素坐标系，原样透传
        assert!(browser.ops().contains(&"click(500,500,Left,1)".to_string()));
    }

    #[tokio::test]
    async fn test_budget_exhausted_forces_done() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(click("c1", 1, 1)),
            Ok(click("c2", 2, 2)),
            Ok(click("c3", 3, 3)),
            Ok(done("forced", true)),
        ]));
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let result = step_loop(llm.clone(), browser)
            .run(RunOptions::new("open settings").with_max_steps(3), &CancellationToken::new())
            .await
            .unwrap();

        let calls = llm.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3].tool_names, vec!["done".to_string()]);
        assert_eq!(calls[3].tool_choice, ToolChoice::Required("done".to_string()));
        // 由强制判断决定，而不是硬编码 false
        assert!(result.completed);
        assert_eq!(
            result.actions.iter().filter(|a| a.action_type == "done").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_forced_done_negative_verdict() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(Generation::text("I could not find the button")),
            Ok(done("forced", false)),
        ]));
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let result = step_loop(llm.clone(), browser)
            .run(RunOptions::new("click the Login button"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(llm.calls().len(), 2);
        assert!(!result.completed);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_done_wins_on_final_step() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(Generation::tool_calls(vec![
            ToolCall::new("c1", "click", json!({"x": 10, "y": 10})),
            ToolCall::new("c2", "done", json!({"success": true, "reasoning": "done"})),
            ToolCall::new("c3", "click", json!({"x": 20, "y": 20})),
        ]))]));
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let result = step_loop(llm.clone(), browser.clone())
            .run(RunOptions::new("click").with_max_steps(1), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed);
        assert_eq!(llm.calls().len(), 1);
        // done 之后的调用被跳过，done 之后也不再截图
        let ops = browser.ops();
        assert!(!ops.contains(&"click(20,20,Left,1)".to_string()));
        assert_eq!(ops.iter().filter(|o| o.as_str() == "screenshot").count(), 1);
    }

    #[tokio::test]
    async fn test_tool_failure_is_fed_back() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(Generation::tool_calls(vec![ToolCall::new("c1", "click", json!({"x": "nope"}))])),
            Ok(done("c2", true)),
        ]));
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let result = step_loop(llm, browser)
            .with_event_tx(tx)
            .run(RunOptions::new("click"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.completed);
        assert!(!result.actions[0].success);
        let tool_msg = result
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c1"))
            .unwrap();
        assert!(tool_msg.text().contains("Invalid arguments for click"));

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, StepEvent::ToolFailure { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_llm_failure_returns_structured_result() {
        let sink = UsageSink::new();
        let llm = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::ApiError(
            "503 upstream".to_string(),
        ))]));
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let result = step_loop(llm, browser)
            .with_usage_sink(sink.clone())
            .run(RunOptions::new("click"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.completed);
        assert!(result.message.contains("503 upstream"));
        assert_eq!(result.usage, TokenUsage::default());
        assert_eq!(sink.snapshot(), TokenUsage::default());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_inference() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::new()).hang_when_exhausted());
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = step_loop(llm, browser)
            .run(RunOptions::new("click"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_images_detached_when_transport_requires() {
        let llm = Arc::new(
            ScriptedLlmClient::new(vec![
                Ok(Generation::tool_calls(vec![ToolCall::new("c1", "screenshot", json!({}))])),
                Ok(done("c2", true)),
            ])
            .with_media_in_tool_results(false),
        );
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let result = step_loop(llm, browser)
            .run(RunOptions::new("look"), &CancellationToken::new())
            .await
            .unwrap();

        let tool_msg = result
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c1"))
            .unwrap();
        assert_eq!(tool_msg.image_count(), 0);
        assert!(result
            .messages
            .iter()
            .any(|m| m.text().contains("Images returned by the tool calls above")
                && m.image_count() == 1));
    }

    #[tokio::test]
    async fn test_screenshot_failure_does_not_abort() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(done("c1", true))]));
        let browser = Arc::new(FakeBrowser::new("https://app.test").failing_screenshots());
        let result = step_loop(llm.clone(), browser)
            .run(RunOptions::new("anything"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.completed);
        assert_eq!(llm.calls()[0].image_count, 0);
    }

    #[tokio::test]
    async fn test_scaled_coordinates_for_google_models() {
        let llm = Arc::new(
            ScriptedLlmClient::new(vec![Ok(click("c1", 500, 500)), Ok(done("c2", true))])
                .with_model(ModelProvider::Google, "google/gemini-2.5-computer-use-preview"),
        );
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        step_loop(llm, browser.clone())
            .run(RunOptions::new("click"), &CancellationToken::new())
            .await
            .unwrap();
        // 实测视口 1000x800
        assert!(browser.ops().contains(&"click(500,400,Left,1)".to_string()));
    }

    struct LookupOrder;

    #[async_trait]
    impl Tool for LookupOrder {
        fn name(&self) -> &str {
            "lookup_order"
        }

        fn description(&self) -> &str {
            "Look up an order by id"
        }

        async fn execute(&self, args: Value) -> Result<Value, String> {
            Ok(json!({ "order": args["id"], "status": "shipped" }))
        }
    }

    #[tokio::test]
    async fn test_custom_tool_and_structured_output() {
        let mut tools = ToolRegistry::new();
        tools.register(LookupOrder).unwrap();
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(Generation::tool_calls(vec![ToolCall::new(
                "c1",
                "lookup_order",
                json!({"id": 42}),
            )])),
            Ok(Generation::tool_calls(vec![ToolCall::new(
                "c2",
                "done",
                json!({"success": true, "reasoning": "found it", "status": "shipped"}),
            )])),
        ]));
        let browser = Arc::new(FakeBrowser::new("https://shop.test"));
        let schema = json!({"type": "object", "properties": {"status": {"type": "string"}}});
        let result = step_loop(llm.clone(), browser)
            .with_tools(tools)
            .run(
                RunOptions::new("find order 42").with_output_schema(schema),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(llm.calls()[0].tool_names.contains(&"lookup_order".to_string()));
        assert_eq!(result.actions[0].detail["result"]["status"], "shipped");
        assert_eq!(result.output, Some(json!({"status": "shipped"})));
    }

    #[tokio::test]
    async fn test_cache_records_then_replays() {
        let cache = Arc::new(AgentCache::new(
            Arc::new(InMemoryCacheStorage::new()),
            CacheMode::Persist,
        ));
        let first_llm = Arc::new(ScriptedLlmClient::new(vec![Ok(click("c1", 500, 500)), Ok(done("c2", true))]));
        let browser = Arc::new(FakeBrowser::new("https://app.test/login"));
        let recorded = step_loop(first_llm, browser)
            .with_cache(cache.clone())
            .run(RunOptions::new("click the Login button"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(recorded.completed);
        assert_eq!(
            recorded.actions[0].selector.as_deref(),
            Some("xpath=//*[@data-point='500,500']")
        );

        let second_llm = Arc::new(ScriptedLlmClient::new(Vec::new()));
        let replay_browser = Arc::new(FakeBrowser::new("https://app.test/login"));
        let replayed = step_loop(second_llm.clone(), replay_browser.clone())
            .with_cache(cache)
            .run(RunOptions::new("click the Login button"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(replayed.completed);
        assert!(second_llm.calls().is_empty());
        assert_eq!(
            replay_browser.ops(),
            vec!["perform(click xpath=//*[@data-point='500,500'])".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cached_structured_output_survives_replay() {
        let cache = Arc::new(AgentCache::new(
            Arc::new(InMemoryCacheStorage::new()),
            CacheMode::Persist,
        ));
        let schema = json!({"type": "object", "properties": {"price": {"type": "number"}}});
        let priced_done = || {
            Generation::tool_calls(vec![ToolCall::new(
                "c2",
                "done",
                json!({"success": true, "reasoning": "Price is 9.5", "price": 9.5}),
            )])
        };
        let live = step_loop(
            Arc::new(ScriptedLlmClient::new(vec![Ok(click("c1", 40, 60)), Ok(priced_done())])),
            Arc::new(FakeBrowser::new("https://shop.test/item/7")),
        )
        .with_cache(cache.clone())
        .run(
            RunOptions::new("read the price").with_output_schema(schema.clone()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(live.output, Some(json!({"price": 9.5})));

        let replay_llm = Arc::new(ScriptedLlmClient::new(Vec::new()));
        let replayed = step_loop(replay_llm.clone(), Arc::new(FakeBrowser::new("https://shop.test/item/7")))
            .with_cache(cache.clone())
            .run(
                RunOptions::new("read the price").with_output_schema(schema),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(replay_llm.calls().is_empty());
        assert!(replayed.completed);
        assert_eq!(replayed.output, live.output);
        assert_eq!(replayed.message, live.message);
        let kinds: Vec<&str> = replayed.actions.iter().map(|a| a.action_type.as_str()).collect();
        assert_eq!(kinds, vec!["click", "done"]);

        // 不带 schema 的同一指令不能命中带 schema 的条目
        let plain_llm = Arc::new(ScriptedLlmClient::new(vec![Ok(click("c1", 40, 60)), Ok(done("c2", true))]));
        let plain = step_loop(plain_llm.clone(), Arc::new(FakeBrowser::new("https://shop.test/item/7")))
            .with_cache(cache)
            .run(RunOptions::new("read the price"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plain_llm.calls().len(), 2);
        assert_eq!(plain.output, None);
    }

    #[tokio::test]
    async fn test_no_locators_without_cache() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(click("c1", 5, 5)), Ok(done("c2", true))]));
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let result = step_loop(llm, browser)
            .run(RunOptions::new("click"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.actions[0].selector, None);
    }

    #[tokio::test]
    async fn test_empty_instruction_is_config_error() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::new()));
        let browser = Arc::new(FakeBrowser::new("https://app.test"));
        let err = step_loop(llm, browser)
            .run(RunOptions::new("  "), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
