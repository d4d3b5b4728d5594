//! MCP stdio server implementing JSON-RPC 2.0 over stdin/stdout.
//!
//! Exposes the orchestrator's task lifecycle, worker runs and story
//! workflows as MCP tools.
//!
//! Protocol: newline-delimited JSON-RPC 2.0 on stdin/stdout.
//! Logging goes to stderr (stdout is reserved for protocol messages).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::application::Services;
use crate::domain::models::{
    ActivityFilter, RunStatus, StoryAnswer, TaskStatus, WorkerSpec, ACTIVITY_LOG_CAP,
};
use crate::domain::{ErrorKind, OpError, OpResult};
use crate::services::lifecycle::PatchTarget;
use crate::services::run_service::{
    RunFilter, RunRequest, DEFAULT_HEARTBEAT, DEFAULT_RUN_LIST_LIMIT, MAX_RUN_LIST_LIMIT, MAX_RUN_TIMEOUT,
};
use crate::services::workflow_service::StoryRequest;

/// Result of one tool call before it is wrapped into MCP content.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Ok(Value),
    /// A completed call whose payload reports failure (e.g. a failing verify)
    Failed(Value),
}

fn to_value<T: Serialize>(value: &T) -> OpResult<Value> {
    serde_json::to_value(value).map_err(|e| OpError::invalid_argument(format!("failed to encode result: {e}")))
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn req_str<'a>(args: &'a Value, key: &str) -> OpResult<&'a str> {
    opt_str(args, key).ok_or_else(|| {
        OpError::invalid_argument(format!("Missing required field: {key}")).with_detail(json!({ "field": key }))
    })
}

fn opt_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn opt_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

fn list_limit(args: &Value) -> usize {
    opt_u64(args, "limit")
        .and_then(|l| usize::try_from(l).ok())
        .unwrap_or(DEFAULT_RUN_LIST_LIMIT)
        .clamp(1, MAX_RUN_LIST_LIMIT)
}

fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": properties,
            "required": required,
        }
    })
}

fn worker_spec_properties() -> Value {
    json!({
        "agentId": { "type": "string" },
        "repoPath": { "type": "string", "description": "Repository the worker operates on" },
        "worktreeDirName": { "type": "string", "description": "Worktree directory under the repo (default .worktrees)" },
        "codexCmd": { "type": "string", "description": "Agent command (default from config)" },
        "role": { "type": "string", "description": "Free-text role label" },
        "kind": { "type": "string", "enum": ["developer", "tech_lead", "pm", "qa"] },
        "isPm": { "type": "boolean" },
        "focus": { "type": "string" },
        "personality": { "type": "string" },
        "verifyCommandKey": { "type": "string" }
    })
}

fn run_properties() -> Value {
    json!({
        "agentId": { "type": "string" },
        "taskId": { "type": "string" },
        "prompt": { "type": "string", "description": "Instructions handed to the coding agent" },
        "baseBranch": { "type": "string" },
        "runAfterCommand": { "type": "string", "description": "Policy command key run after the agent" },
        "timeoutMs": { "type": "integer", "description": "Agent timeout (default 300000, max 3600000)" },
        "requireVerify": { "type": "boolean", "description": "Run the verify command (default true)" },
        "verifyCommandKey": { "type": "string", "description": "Policy command key (default test)" },
        "autoSetTaskStatus": { "type": "boolean", "description": "Move the task through doing/in_review/blocked (default true)" },
        "heartbeatMs": { "type": "integer", "description": "Async heartbeat interval (3000..=120000)" }
    })
}

/// Every tool the server exposes.
pub fn tool_definitions() -> Vec<Value> {
    let task_agent = json!({ "taskId": { "type": "string" }, "agentId": { "type": "string" } });
    vec![
        tool("ping", "Health check", json!({ "message": { "type": "string" } }), &[]),
        tool(
            "enqueueTask",
            "Create a todo implementation task",
            json!({
                "title": { "type": "string" },
                "description": { "type": "string" },
                "assignee": { "type": "string" }
            }),
            &["title"],
        ),
        tool(
            "assignTask",
            "Assign a task to an agent",
            json!({ "taskId": { "type": "string" }, "assignee": { "type": "string" } }),
            &["taskId", "assignee"],
        ),
        tool(
            "claimTask",
            "Claim a todo or rejected task and prepare its worktree",
            task_agent,
            &["taskId", "agentId"],
        ),
        tool(
            "submitTask",
            "Submit a doing task for tech lead review",
            json!({
                "taskId": { "type": "string" },
                "agentId": { "type": "string" },
                "summary": { "type": "string" }
            }),
            &["taskId", "agentId"],
        ),
        tool(
            "acceptTask",
            "Advance a task one acceptance stage; the final stage integrates its commit",
            json!({ "taskId": { "type": "string" } }),
            &["taskId"],
        ),
        tool(
            "rejectTask",
            "Reject a task under review and request rework",
            json!({ "taskId": { "type": "string" }, "reason": { "type": "string" } }),
            &["taskId", "reason"],
        ),
        tool(
            "setTaskStatus",
            "Manually set a task status (done is gated)",
            json!({
                "taskId": { "type": "string" },
                "status": { "type": "string", "enum": TaskStatus::ALL.iter().map(TaskStatus::as_str).collect::<Vec<_>>() }
            }),
            &["taskId", "status"],
        ),
        tool(
            "registerWorker",
            "Register a worker bound to a repository",
            worker_spec_properties(),
            &["agentId", "repoPath"],
        ),
        tool(
            "spawnWorker",
            "Alias of registerWorker",
            worker_spec_properties(),
            &["agentId", "repoPath"],
        ),
        tool(
            "loadAgentRoles",
            "Load role profiles from .agent/roles.md frontmatter",
            json!({
                "repoPath": { "type": "string" },
                "filePath": { "type": "string" },
                "replaceAll": { "type": "boolean" }
            }),
            &[],
        ),
        tool(
            "reloadConfig",
            "Re-read the workers file and reset caches",
            json!({
                "workersFile": { "type": "string" },
                "resetWorkers": { "type": "boolean" },
                "resetRoles": { "type": "boolean" },
                "clearPolicyCache": { "type": "boolean" }
            }),
            &[],
        ),
        tool(
            "runCommand",
            "Run a policy command in the worker's repository",
            json!({
                "agentId": { "type": "string" },
                "commandKey": { "type": "string" },
                "cwd": { "type": "string", "description": "Directory inside the repository" }
            }),
            &["agentId", "commandKey"],
        ),
        tool(
            "verifyTask",
            "Run a policy verify command in the task worktree",
            json!({
                "agentId": { "type": "string" },
                "taskId": { "type": "string" },
                "commandKey": { "type": "string" }
            }),
            &["agentId", "taskId", "commandKey"],
        ),
        tool(
            "runWorkerTask",
            "Run the coding agent on a task and wait for the result",
            run_properties(),
            &["agentId", "taskId", "prompt"],
        ),
        tool(
            "startRunWorkerTask",
            "Start a worker run in the background and return its run id",
            run_properties(),
            &["agentId", "taskId", "prompt"],
        ),
        tool(
            "getRunStatus",
            "Fetch an async run record",
            json!({ "runId": { "type": "string" } }),
            &["runId"],
        ),
        tool(
            "listRuns",
            "List async runs, newest first",
            json!({
                "taskId": { "type": "string" },
                "agentId": { "type": "string" },
                "status": { "type": "string", "enum": ["queued", "running", "succeeded", "failed", "canceled"] },
                "limit": { "type": "integer" }
            }),
            &[],
        ),
        tool(
            "cancelRun",
            "Request cancellation of an async run",
            json!({ "runId": { "type": "string" } }),
            &["runId"],
        ),
        tool(
            "applyPatch",
            "Apply a unified diff to the task worktree or the repository",
            json!({
                "agentId": { "type": "string" },
                "taskId": { "type": "string" },
                "patch": { "type": "string" },
                "target": { "type": "string", "enum": ["worktree", "repo"] }
            }),
            &["agentId", "taskId", "patch"],
        ),
        tool(
            "cleanupWorktree",
            "Remove a task worktree",
            json!({
                "agentId": { "type": "string" },
                "taskId": { "type": "string" },
                "force": { "type": "boolean" },
                "deleteBranch": { "type": "boolean" },
                "archiveBeforeForce": { "type": "boolean" }
            }),
            &["agentId", "taskId"],
        ),
        tool(
            "reportProgress",
            "Record a progress note for a doing task",
            json!({
                "taskId": { "type": "string" },
                "agentId": { "type": "string" },
                "message": { "type": "string" }
            }),
            &["taskId", "agentId", "message"],
        ),
        tool(
            "runStoryWorkflow",
            "Clarify a story, decompose it into tasks and optionally start execution",
            json!({
                "workflowId": { "type": "string" },
                "story": { "type": "string" },
                "answers": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "questionId": { "type": "string" }, "answer": { "type": "string" } },
                        "required": ["questionId", "answer"]
                    }
                },
                "autoExecute": { "type": "boolean" },
                "baseBranch": { "type": "string" }
            }),
            &[],
        ),
        tool(
            "activityLog",
            "Recent activity events",
            json!({
                "workflowId": { "type": "string" },
                "agentId": { "type": "string" },
                "runId": { "type": "string" },
                "limit": { "type": "integer" },
                "format": { "type": "string", "enum": ["json", "text"] }
            }),
            &[],
        ),
        tool("status", "Task counts, workers, runs and persistence health", json!({}), &[]),
    ]
}

/// MCP stdio server over the orchestrator services.
pub struct StdioServer {
    services: Arc<Services>,
}

impl StdioServer {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run the stdio server loop, reading JSON-RPC from stdin and writing responses to stdout.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
    }

    /// Serve newline-delimited requests from `reader` until EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("stdio server started");
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.handle_message(line).await;
            if response.is_empty() {
                continue;
            }
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        info!("stdio server stopped");
        Ok(())
    }

    /// Handle one JSON-RPC message. Notifications produce an empty string.
    pub async fn handle_message(&self, line: &str) -> String {
        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return error_response(Value::Null, -32700, &format!("Parse error: {e}")),
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        match method {
            "initialize" => success_response(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "cowai", "version": env!("CARGO_PKG_VERSION") }
                }),
            ),
            "tools/list" => success_response(id, json!({ "tools": tool_definitions() })),
            "tools/call" => self.handle_tools_call(id, &params).await,
            "notifications/initialized" => String::new(),
            _ => error_response(id, -32601, &format!("Method not found: {method}")),
        }
    }

    async fn handle_tools_call(&self, id: Value, params: &Value) -> String {
        let tool_name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        debug!(tool = tool_name, "tool call");

        let (payload, is_error) = match self.call_tool(tool_name, &arguments).await {
            Ok(ToolOutput::Ok(value)) => (value, false),
            Ok(ToolOutput::Failed(value)) => (value, true),
            Err(err) => {
                warn!(tool = tool_name, error = %err, "tool call failed");
                (err.to_json(), true)
            }
        };
        let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
        let mut result = json!({ "content": [{ "type": "text", "text": text }] });
        if is_error {
            result["isError"] = Value::Bool(true);
        }
        success_response(id, result)
    }

    /// Dispatch one tool call.
    pub async fn call_tool(&self, name: &str, args: &Value) -> OpResult<ToolOutput> {
        let ok = |v: Value| -> OpResult<ToolOutput> { Ok(ToolOutput::Ok(v)) };
        let svc = &self.services;
        match name {
            "ping" => ok(json!(opt_str(args, "message").map_or_else(|| "pong".to_string(), |m| format!("pong: {m}")))),
            "enqueueTask" => {
                let task = svc
                    .lifecycle
                    .enqueue(
                        req_str(args, "title")?,
                        opt_str(args, "description").map(str::to_string),
                        opt_str(args, "assignee").map(str::to_string),
                    )
                    .await?;
                ok(json!({ "ok": true, "task": task }))
            }
            "assignTask" => {
                let task = svc
                    .lifecycle
                    .assign(req_str(args, "taskId")?, req_str(args, "assignee")?)
                    .await?;
                ok(json!({ "ok": true, "task": task }))
            }
            "claimTask" => {
                let claimed = svc
                    .lifecycle
                    .claim(req_str(args, "taskId")?, req_str(args, "agentId")?)
                    .await?;
                ok(json!({ "ok": true, "claim": claimed }))
            }
            "submitTask" => {
                let task = svc
                    .lifecycle
                    .submit(req_str(args, "taskId")?, req_str(args, "agentId")?, opt_str(args, "summary"))
                    .await?;
                ok(json!({ "ok": true, "task": task }))
            }
            "acceptTask" => ok(svc.acceptance.accept(req_str(args, "taskId")?).await?.to_json()),
            "rejectTask" => {
                let task = svc
                    .lifecycle
                    .reject(req_str(args, "taskId")?, req_str(args, "reason")?)
                    .await?;
                ok(json!({ "ok": true, "task": task }))
            }
            "setTaskStatus" => {
                let raw = req_str(args, "status")?;
                let status = TaskStatus::from_str(raw).ok_or_else(|| {
                    OpError::invalid_argument(format!("Invalid status: {raw}")).with_detail(json!({ "status": raw }))
                })?;
                let task = svc.lifecycle.set_status(req_str(args, "taskId")?, status).await?;
                ok(json!({ "ok": true, "task": task }))
            }
            "registerWorker" | "spawnWorker" => {
                let spec: WorkerSpec = serde_json::from_value(args.clone())
                    .map_err(|e| OpError::invalid_argument(format!("invalid worker spec: {e}")))?;
                let registered = svc.registry.register(spec).await?;
                ok(json!({ "ok": true, "worker": registered }))
            }
            "loadAgentRoles" => {
                let loaded = svc
                    .registry
                    .load_roles(
                        opt_str(args, "repoPath"),
                        opt_str(args, "filePath"),
                        opt_bool(args, "replaceAll", false),
                    )
                    .await?;
                ok(json!({ "ok": true, "roles": loaded }))
            }
            "reloadConfig" => {
                let report = svc
                    .registry
                    .reload(
                        opt_str(args, "workersFile"),
                        opt_bool(args, "resetWorkers", true),
                        opt_bool(args, "resetRoles", true),
                        opt_bool(args, "clearPolicyCache", true),
                    )
                    .await?;
                ok(json!({ "ok": true, "reload": report }))
            }
            "runCommand" => {
                let result = svc
                    .runs
                    .run_command(req_str(args, "agentId")?, req_str(args, "commandKey")?, opt_str(args, "cwd"))
                    .await?;
                ok(to_value(&result)?)
            }
            "verifyTask" => {
                let outcome = svc
                    .runs
                    .verify_task(
                        req_str(args, "agentId")?,
                        req_str(args, "taskId")?,
                        req_str(args, "commandKey")?,
                    )
                    .await?;
                let value = to_value(&outcome)?;
                Ok(if outcome.result.ok {
                    ToolOutput::Ok(value)
                } else {
                    ToolOutput::Failed(value)
                })
            }
            "runWorkerTask" => {
                let report = svc.runs.run_worker_task(&run_request(args)?).await?;
                ok(to_value(&report)?)
            }
            "startRunWorkerTask" => {
                let heartbeat = opt_u64(args, "heartbeatMs").map_or(DEFAULT_HEARTBEAT, Duration::from_millis);
                let run = svc.runs.start(run_request(args)?, heartbeat).await;
                ok(json!({ "ok": true, "runId": run.run_id, "run": run }))
            }
            "getRunStatus" => ok(to_value(&svc.runs.get_run(req_str(args, "runId")?).await?)?),
            "listRuns" => {
                let status = opt_str(args, "status")
                    .map(|s| {
                        RunStatus::parse(s)
                            .ok_or_else(|| OpError::invalid_argument(format!("Invalid run status: {s}")))
                    })
                    .transpose()?;
                let filter = RunFilter {
                    task_id: opt_str(args, "taskId").map(str::to_string),
                    agent_id: opt_str(args, "agentId").map(str::to_string),
                    status,
                    limit: Some(list_limit(args)),
                };
                let runs = svc.runs.list_runs(&filter).await;
                ok(json!({ "ok": true, "runs": runs }))
            }
            "cancelRun" => ok(to_value(&svc.runs.cancel(req_str(args, "runId")?).await?)?),
            "applyPatch" => {
                let target = match opt_str(args, "target") {
                    None => PatchTarget::Worktree,
                    Some(raw) => PatchTarget::parse(raw)
                        .ok_or_else(|| OpError::invalid_argument(format!("Invalid target: {raw}")))?,
                };
                let patch = args
                    .get("patch")
                    .and_then(Value::as_str)
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| OpError::invalid_argument("Missing required field: patch"))?;
                let outcome = svc
                    .lifecycle
                    .apply_patch(req_str(args, "agentId")?, req_str(args, "taskId")?, patch, target)
                    .await?;
                let value = to_value(&outcome)?;
                Ok(if outcome.ok {
                    ToolOutput::Ok(value)
                } else {
                    ToolOutput::Failed(value)
                })
            }
            "cleanupWorktree" => {
                let report = svc
                    .lifecycle
                    .cleanup_worktree(
                        req_str(args, "agentId")?,
                        req_str(args, "taskId")?,
                        opt_bool(args, "force", false),
                        opt_bool(args, "deleteBranch", false),
                        opt_bool(args, "archiveBeforeForce", false),
                    )
                    .await?;
                ok(to_value(&report)?)
            }
            "reportProgress" => {
                let message = args.get("message").and_then(Value::as_str).unwrap_or("");
                let report = svc
                    .lifecycle
                    .report_progress(req_str(args, "taskId")?, req_str(args, "agentId")?, message)
                    .await?;
                ok(json!({ "ok": true, "progress": report }))
            }
            "runStoryWorkflow" => {
                let answers: Vec<StoryAnswer> = match args.get("answers") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(raw) => serde_json::from_value(raw.clone())
                        .map_err(|e| OpError::invalid_argument(format!("invalid answers: {e}")))?,
                };
                let req = StoryRequest {
                    workflow_id: opt_str(args, "workflowId").map(str::to_string),
                    story: opt_str(args, "story").map(str::to_string),
                    answers,
                    auto_execute: opt_bool(args, "autoExecute", true),
                    base_branch: opt_str(args, "baseBranch").unwrap_or("main").to_string(),
                };
                ok(to_value(&svc.workflows.run(&req).await?)?)
            }
            "activityLog" => {
                let filter = ActivityFilter {
                    workflow_id: opt_str(args, "workflowId").map(str::to_string),
                    agent_id: opt_str(args, "agentId").map(str::to_string),
                    run_id: opt_str(args, "runId").map(str::to_string),
                };
                let limit = list_limit(args).min(ACTIVITY_LOG_CAP);
                let events = svc.store.activity(&filter, limit).await;
                if opt_str(args, "format") == Some("text") {
                    let lines: Vec<String> = events.iter().map(|e| e.to_line()).collect();
                    ok(Value::String(lines.join("\n")))
                } else {
                    ok(json!({ "ok": true, "events": events }))
                }
            }
            "status" => ok(self.status().await),
            _ => Err(OpError::invalid_argument(format!("Unknown tool: {name}")).with_detail(json!({ "tool": name }))),
        }
    }

    async fn status(&self) -> Value {
        let health = self.services.store.health();
        self.services
            .store
            .read(|s| {
                let counts: serde_json::Map<String, Value> = TaskStatus::ALL
                    .iter()
                    .map(|st| (st.as_str().to_string(), json!(s.tasks.iter().filter(|t| t.status == *st).count())))
                    .collect();
                json!({
                    "ok": true,
                    "counts": counts,
                    "tasks": s.tasks,
                    "workflows": s.workflows,
                    "workers": s.workers,
                    "agentRoles": s.agent_roles.values().collect::<Vec<_>>(),
                    "runs": s.runs.len(),
                    "lastCommand": s.last_command,
                    "persistence": health,
                })
            })
            .await
    }
}

fn run_request(args: &Value) -> OpResult<RunRequest> {
    let mut req = RunRequest::new(
        req_str(args, "agentId")?,
        req_str(args, "taskId")?,
        req_str(args, "prompt")?,
    );
    req.base_branch = opt_str(args, "baseBranch").map(str::to_string);
    req.run_after_command = opt_str(args, "runAfterCommand").map(str::to_string);
    if let Some(ms) = opt_u64(args, "timeoutMs") {
        if ms == 0 {
            return Err(OpError::new(ErrorKind::InvalidArgument, "timeoutMs must be positive"));
        }
        req.timeout = Duration::from_millis(ms).min(MAX_RUN_TIMEOUT);
    }
    req.require_verify = opt_bool(args, "requireVerify", true);
    if let Some(key) = opt_str(args, "verifyCommandKey") {
        req.verify_command_key = key.to_string();
    }
    req.auto_set_task_status = opt_bool(args, "autoSetTaskStatus", true);
    Ok(req)
}

fn success_response(id: Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } }).to_string()
}
