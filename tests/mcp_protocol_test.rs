//! MCP stdio protocol tests driven through in-memory pipes.

mod common;

use common::{init_repo, services, write_policy};
use cowai::adapters::mcp::StdioServer;
use serde_json::{json, Value};
use tokio::io::BufReader;

/// Feed `requests` through the server and return the parsed responses.
async fn exchange(server: &StdioServer, requests: &[Value]) -> Vec<Value> {
    let input: String = requests.iter().map(|r| format!("{r}\n")).collect();
    let mut output = Vec::new();
    server
        .serve(BufReader::new(input.as_bytes()), &mut output)
        .await
        .unwrap();
    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn call(id: u64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

fn payload(response: &Value) -> Value {
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn test_handshake_and_tool_listing() {
    let dir = tempfile::tempdir().unwrap();
    let server = StdioServer::new(services(dir.path()));

    let responses = exchange(
        &server,
        &[
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            json!({"jsonrpc": "2.0", "id": 3, "method": "bogus/method"}),
        ],
    )
    .await;

    assert_eq!(responses.len(), 3, "notifications get no response");
    assert_eq!(responses[0]["result"]["serverInfo"]["name"], "cowai");

    let names: Vec<&str> = responses[1]["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    for expected in ["enqueueTask", "claimTask", "acceptTask", "runStoryWorkflow", "activityLog"] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }

    assert_eq!(responses[2]["error"]["code"], -32601);
    assert_eq!(responses[2]["id"], 3);
}

#[tokio::test]
async fn test_parse_error_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let server = StdioServer::new(services(dir.path()));

    let input = "not json\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"tools/call\",\"params\":{\"name\":\"ping\"}}\n";
    let mut output = Vec::new();
    server.serve(BufReader::new(input.as_bytes()), &mut output).await.unwrap();
    let lines: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(lines[0]["error"]["code"], -32700);
    assert_eq!(payload(&lines[1]), json!("pong"));
}

#[tokio::test]
async fn test_tool_errors_are_reported_in_band() {
    let dir = tempfile::tempdir().unwrap();
    let server = StdioServer::new(services(dir.path()));

    let responses = exchange(
        &server,
        &[
            call(1, "enqueueTask", json!({})),
            call(2, "claimTask", json!({"taskId": "nope", "agentId": "W1"})),
        ],
    )
    .await;

    assert_eq!(responses[0]["result"]["isError"], true);
    assert_eq!(payload(&responses[0])["error"], "INVALID_ARGUMENT");
    assert_eq!(payload(&responses[1])["error"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_register_enqueue_and_status_over_the_wire() {
    let (dir, repo) = init_repo();
    write_policy(&repo);
    let server = StdioServer::new(services(dir.path()));
    let repo_path = repo.to_string_lossy().into_owned();

    let responses = exchange(
        &server,
        &[
            call(1, "registerWorker", json!({"agentId": "W1", "repoPath": repo_path})),
            call(2, "enqueueTask", json!({"title": "Wire test", "assignee": "W1"})),
            call(3, "runCommand", json!({"agentId": "W1", "commandKey": "test"})),
            call(4, "runCommand", json!({"agentId": "W1", "commandKey": "rm -rf /"})),
            call(5, "status", json!({})),
        ],
    )
    .await;

    assert!(responses[0]["result"].get("isError").is_none());
    let task = &payload(&responses[1])["task"];
    assert_eq!(task["status"], "todo");
    assert_eq!(task["assignee"], "W1");

    assert_eq!(payload(&responses[2])["ok"], true);
    assert_eq!(payload(&responses[3])["error"], "COMMAND_REJECTED");

    let status = payload(&responses[4]);
    assert_eq!(status["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(status["workers"].as_array().unwrap().len(), 1);
}
