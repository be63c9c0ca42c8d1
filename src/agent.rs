//! Remote Executor: the desktop companion that drains a user's command
//! queue and performs the local actions.
//!
//! Protocol order matters: probe the server, log in, verify the
//! entitlement, and only then start polling. An account without
//! external tools access must refuse to poll instead of spinning
//! against 403s.

use std::process::Command as ProcessCommand;
use std::thread;
use std::time::Duration;

use serde_json::json;
use url::form_urlencoded;

use crate::{Instruction, STANDALONE_EXECUTABLE, shell_command_vec};

const CONNECT_TIMEOUT_MS: u64 = 5_000;
const REQUEST_TIMEOUT_MS: u64 = 10_000;

pub(crate) struct AgentOptions {
    pub(crate) server_url: String,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) poll_secs: u64,
    pub(crate) error_backoff_secs: u64,
}

pub(crate) fn run_agent(options: AgentOptions) -> Result<(), Box<dyn std::error::Error>> {
    let client = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(CONNECT_TIMEOUT_MS))
        .timeout_read(Duration::from_millis(REQUEST_TIMEOUT_MS))
        .timeout_write(Duration::from_millis(REQUEST_TIMEOUT_MS))
        .redirects(0)
        .build();
    let server_url = normalize_server_url(&options.server_url);

    // Reachability probe before sending credentials anywhere.
    if let Err(ureq::Error::Transport(err)) = client.get(&server_url).call() {
        return Err(format!("server unreachable: {err}").into());
    }

    let cookie = login(&client, &server_url, &options.username, &options.password)?;

    let check: serde_json::Value = client
        .get(&format!("{server_url}/check-external-features"))
        .set("Cookie", &cookie)
        .call()?
        .into_json()?;
    if !check
        .get("has_external_features")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return Err("access denied: external tools are not enabled for this account".into());
    }
    eprintln!("connected to {server_url}; external tools access confirmed");

    loop {
        match poll_once(&client, &server_url, &cookie) {
            Ok(()) => thread::sleep(Duration::from_secs(options.poll_secs)),
            Err(err) => {
                eprintln!("poll error: {err}");
                thread::sleep(Duration::from_secs(options.error_backoff_secs));
            }
        }
    }
}

pub(crate) fn normalize_server_url(raw: &str) -> String {
    let mut url = raw.trim().to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("http://{url}");
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn login(
    client: &ureq::Agent,
    server_url: &str,
    username: &str,
    password: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let payload = form_urlencoded::Serializer::new(String::new())
        .append_pair("username", username)
        .append_pair("password", password)
        .finish();
    let response = client
        .post(&format!("{server_url}/login"))
        .set("content-type", "application/x-www-form-urlencoded")
        .send_string(&payload);
    let response = match response {
        Ok(resp) => resp,
        Err(ureq::Error::Status(401, _)) => {
            return Err("login failed: invalid username or password".into());
        }
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            return Err(format!("login failed: {code} {text}").into());
        }
        Err(err) => return Err(format!("login request failed: {err}").into()),
    };
    for value in response.all("set-cookie") {
        if let Some(token_pair) = value.split(';').next() {
            if token_pair.trim().starts_with("session=") {
                return Ok(token_pair.trim().to_string());
            }
        }
    }
    Err("login response carried no session cookie".into())
}

fn poll_once(
    client: &ureq::Agent,
    server_url: &str,
    cookie: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let data: serde_json::Value = client
        .get(&format!("{server_url}/api/client-service/queue"))
        .set("Cookie", cookie)
        .call()?
        .into_json()?;
    if !data.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Err("queue poll rejected".into());
    }
    let empty = Vec::new();
    let queue = data.get("queue").and_then(|v| v.as_array()).unwrap_or(&empty);

    for item in queue {
        if item.get("status").and_then(|v| v.as_str()) != Some("pending") {
            continue;
        }
        let id = item.get("id").and_then(|v| v.as_str()).unwrap_or("");
        if id.is_empty() {
            continue;
        }
        if item.get("type").and_then(|v| v.as_str()) == Some("command") {
            let raw = item.get("command").and_then(|v| v.as_str()).unwrap_or("");
            match Instruction::parse(raw) {
                Ok(instruction) => match execute_instruction(&instruction) {
                    Ok(()) => complete_task(client, server_url, cookie, id),
                    Err(err) => eprintln!("command execution failed ({raw}): {err}"),
                },
                // Malformed entries are left pending; rejecting them must
                // not take the poll loop down.
                Err(err) => eprintln!("rejected command: {err}"),
            }
        } else if let Some(tool_id) = item.get("tool_id").and_then(|v| v.as_str()) {
            // Legacy bare task: drive it back through the run endpoint
            // and act on the returned descriptor.
            eprintln!("processing legacy task: {tool_id}");
            if let Err(err) = run_tool_via_server(client, server_url, cookie, tool_id) {
                eprintln!("legacy task failed ({tool_id}): {err}");
            }
            complete_task(client, server_url, cookie, id);
        }
    }
    Ok(())
}

fn complete_task(client: &ureq::Agent, server_url: &str, cookie: &str, command_id: &str) {
    let response = client
        .post(&format!("{server_url}/api/client-service/queue"))
        .set("Cookie", cookie)
        .send_json(json!({"action": "complete", "task_id": command_id}));
    match response {
        Ok(_) => eprintln!("command {command_id} marked as completed"),
        Err(ureq::Error::Status(code, _)) => {
            eprintln!("failed to complete command {command_id}: HTTP {code}");
        }
        Err(err) => eprintln!("failed to complete command {command_id}: {err}"),
    }
}

fn run_tool_via_server(
    client: &ureq::Agent,
    server_url: &str,
    cookie: &str,
    tool_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .post(&format!("{server_url}/api/external-tools/run"))
        .set("Cookie", cookie)
        .send_json(json!({"toolId": tool_id}));
    let data: serde_json::Value = match response {
        Ok(resp) => resp.into_json()?,
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            return Err(format!("run failed: {code} {text}").into());
        }
        Err(err) => return Err(format!("run request failed: {err}").into()),
    };
    perform_descriptor_action(&data).map_err(Into::into)
}

/// Act on a dispatch descriptor in the local environment.
pub(crate) fn perform_descriptor_action(data: &serde_json::Value) -> Result<(), String> {
    let action = data.get("action").and_then(|v| v.as_str()).unwrap_or("");
    match action {
        "open_url" | "protocol" => {
            let url = data.get("url").and_then(|v| v.as_str()).unwrap_or("");
            if url.is_empty() {
                return Err("descriptor carried no url".to_string());
            }
            open_in_browser(url)
        }
        "execute" => {
            let executable = data
                .get("executable")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if executable.is_empty() {
                return Err("descriptor carried no executable".to_string());
            }
            spawn_shell(executable)
        }
        // The queued command arrives on a later poll; nothing local to do.
        "client_service" => Ok(()),
        other => Err(format!("unknown action: {other}")),
    }
}

pub(crate) fn execute_instruction(instruction: &Instruction) -> Result<(), String> {
    match instruction {
        Instruction::ToolLaunch {
            tool_id,
            executable,
        } => {
            if executable == STANDALONE_EXECUTABLE {
                eprintln!("launching standalone {tool_id}");
                Ok(())
            } else {
                eprintln!("launching tool: {executable}");
                spawn_shell(executable)
            }
        }
        Instruction::System { command_line } => {
            eprintln!("executing system command: {command_line}");
            spawn_shell(command_line)
        }
    }
}

fn spawn_shell(command: &str) -> Result<(), String> {
    let parts = shell_command_vec(command);
    let mut process = ProcessCommand::new(&parts[0]);
    process.args(&parts[1..]);
    process
        .spawn()
        .map(|_| ())
        .map_err(|e| format!("spawn failed: {e}"))
}

fn open_in_browser(url: &str) -> Result<(), String> {
    let (program, args) = if cfg!(target_os = "macos") {
        ("open", vec![url.to_string()])
    } else if cfg!(windows) {
        (
            "cmd",
            vec!["/C".to_string(), "start".to_string(), String::new(), url.to_string()],
        )
    } else {
        ("xdg-open", vec![url.to_string()])
    };
    ProcessCommand::new(program)
        .args(&args)
        .spawn()
        .map(|_| ())
        .map_err(|e| format!("open url failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_normalization() {
        assert_eq!(
            normalize_server_url("192.168.1.5:8080"),
            "http://192.168.1.5:8080"
        );
        assert_eq!(
            normalize_server_url("https://portal.example/"),
            "https://portal.example"
        );
        assert_eq!(
            normalize_server_url("  http://portal.example  "),
            "http://portal.example"
        );
    }

    #[test]
    fn standalone_launch_is_a_local_no_op() {
        let instruction = Instruction::ToolLaunch {
            tool_id: "viewer".to_string(),
            executable: STANDALONE_EXECUTABLE.to_string(),
        };
        assert!(execute_instruction(&instruction).is_ok());
    }

    #[test]
    fn unknown_descriptor_action_is_rejected() {
        assert!(perform_descriptor_action(&json!({"action": "teleport"})).is_err());
        assert!(perform_descriptor_action(&json!({"action": "open_url"})).is_err());
        assert!(perform_descriptor_action(&json!({"action": "execute"})).is_err());
    }

    #[test]
    fn client_service_descriptor_needs_no_local_action() {
        let data = json!({"action": "client_service", "tool_id": "t1", "command_id": "c1"});
        assert!(perform_descriptor_action(&data).is_ok());
    }
}
