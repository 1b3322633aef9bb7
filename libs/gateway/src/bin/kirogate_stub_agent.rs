//! A tiny scripted stand-in for the real `kiro` binary, used only by the
//! end-to-end tests under `libs/gateway/tests/`. Speaks the same
//! NDJSON JSON-RPC 2.0 line protocol `AgentSession` drives, scripted by a
//! handful of CLI flags instead of an actual agent loop.
//!
//! Flags (all optional):
//!   --reply <text>          text emitted as the `agent_message_chunk` reply
//!   --fail-marker <path>    first `prompt` call (when the file is absent)
//!                           responds with the invalid-history RPC error and
//!                           creates the file; every call after that (a
//!                           freshly spawned process, in practice) succeeds
//!   --context-pct <pct>     emit an extension notification carrying this
//!                           `contextUsagePercentage` before the reply
//!   --log-file <path>       append the received prompt text, one per line
//!   --hang                  accept the prompt but never respond or emit
//!                           anything (simulates total silence)

use std::io::{self, BufRead, Write};

struct Script {
    reply: String,
    fail_marker: Option<String>,
    context_pct: Option<f64>,
    log_file: Option<String>,
    hang: bool,
}

fn parse_args() -> Script {
    let mut reply = "Hello!".to_string();
    let mut fail_marker = None;
    let mut context_pct = None;
    let mut log_file = None;
    let mut hang = false;

    // argv[0] is the program path, argv[1] is the subcommand kirogate always
    // passes first (e.g. "agent"); neither carries scripting information.
    let mut args = std::env::args().skip(2);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--reply" => reply = args.next().unwrap_or_default(),
            "--fail-marker" => fail_marker = args.next(),
            "--context-pct" => context_pct = args.next().and_then(|v| v.parse().ok()),
            "--log-file" => log_file = args.next(),
            "--hang" => hang = true,
            _ => {}
        }
    }

    Script {
        reply,
        fail_marker,
        context_pct,
        log_file,
        hang,
    }
}

fn write_line(value: &serde_json::Value) {
    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}

fn handle_prompt(script: &Script, id: Option<serde_json::Value>, params: Option<&serde_json::Value>) {
    let text = params
        .and_then(|p| p.get("prompt"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string();

    if let Some(path) = &script.log_file
        && let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path)
    {
        let _ = writeln!(f, "{text}");
    }

    if script.hang {
        return;
    }

    if let Some(marker) = &script.fail_marker
        && !std::path::Path::new(marker).exists()
    {
        let _ = std::fs::write(marker, b"spawned-once");
        if let Some(id) = id {
            write_line(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32000, "message": "invalid conversation history received"},
            }));
        }
        return;
    }

    write_line(&serde_json::json!({
        "jsonrpc": "2.0",
        "method": "sessionUpdate",
        "params": {
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": script.reply},
            },
        },
    }));

    if let Some(pct) = script.context_pct {
        write_line(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "contextNotification",
            "params": {"metadata": {"contextUsagePercentage": pct}},
        }));
    }

    if let Some(id) = id {
        write_line(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"stopReason": "end_turn"},
        }));
    }
}

fn main() {
    let script = parse_args();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        let method = value.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let id = value.get("id").cloned();
        let params = value.get("params");

        match method {
            "initialize" => {
                if let Some(id) = id {
                    write_line(&serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"protocolVersion": 1, "agentCapabilities": {}},
                    }));
                }
            }
            "newSession" => {
                if let Some(id) = id {
                    write_line(&serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"sessionId": "stub-session"},
                    }));
                }
            }
            "prompt" => handle_prompt(&script, id, params),
            _ => {}
        }
    }
}
