//! HTTP surface of the portal's external-tools subsystem.
//!
//! tiny_http with a small worker pool; handlers are synchronous and the
//! command queue is the only shared state needing finer locking than
//! the identity store's single connection.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};
use url::form_urlencoded;

use crate::{
    CommandQueue, DispatchContext, Principal, QueuedCommand, ServerToolRecord, SessionStore, Tool,
    ToolError, ToolRegistry, ToolSettings, ToolSource, UserDb, UserToolData, UserToolRecord,
    client_tools_dir, execute_tool, load_recent_audit, log_dir_path, next_command_id, now_iso,
    session_cookie, token_from_cookie_header, tools_config_path, user_db_path,
};

type HttpResponse = Response<io::Cursor<Vec<u8>>>;

pub(crate) struct ServerState {
    pub(crate) db: Mutex<UserDb>,
    pub(crate) registry: ToolRegistry,
    pub(crate) queue: CommandQueue,
    pub(crate) sessions: SessionStore,
    pub(crate) data_dir: PathBuf,
    pub(crate) admin_password: String,
}

pub(crate) fn run_server(
    bind: String,
    port: u16,
    data_dir: PathBuf,
    admin_password: String,
    workers: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = UserDb::open_or_create(&user_db_path(&data_dir))?;
    let state = Arc::new(ServerState {
        db: Mutex::new(db),
        registry: ToolRegistry::new(tools_config_path(&data_dir)),
        queue: CommandQueue::new(),
        sessions: SessionStore::new(),
        data_dir,
        admin_password,
    });

    let addr = format!("{bind}:{port}");
    let server = Server::http(&addr)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("server: {e}")))?;
    eprintln!("toolshed listening on http://{addr}");

    let server = Arc::new(server);
    let mut handles = Vec::new();
    for _ in 0..workers.max(1) {
        let server = Arc::clone(&server);
        let state = Arc::clone(&state);
        handles.push(thread::spawn(move || {
            loop {
                let request = match server.recv() {
                    Ok(request) => request,
                    Err(err) => {
                        eprintln!("accept error: {err}");
                        continue;
                    }
                };
                handle_request(&state, request);
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn handle_request(state: &ServerState, mut request: Request) {
    let method = request.method().clone();
    let path = request
        .url()
        .splitn(2, '?')
        .next()
        .unwrap_or("/")
        .to_string();

    let response = match (&method, path.as_str()) {
        (Method::Get, "/") => Response::from_string("ok"),
        (Method::Post, "/login") => handle_login(state, &mut request),
        (Method::Get, "/logout") | (Method::Post, "/logout") => handle_logout(state, &request),
        (Method::Get, "/check-external-features") => handle_check_external(state, &request),
        (Method::Get, "/api/external-tools") => handle_list_tools(state, &request),
        (Method::Post, "/api/external-tools/run") => handle_run_tool(state, &mut request),
        (Method::Get, "/api/client-service/queue") => handle_queue_peek(state, &request),
        (Method::Post, "/api/client-service/queue") => handle_queue_post(state, &mut request),
        (Method::Get, "/api/account/external-tools") => handle_account_tools_get(state, &request),
        (Method::Post, "/api/account/external-tools") => {
            handle_account_tools_post(state, &mut request)
        }
        (Method::Get, "/api/admin/external-tools") => handle_admin_tools_get(state, &request),
        (Method::Post, "/api/admin/external-tools") => handle_admin_tools_post(state, &mut request),
        (Method::Get, "/api/admin/tool-usage") => handle_admin_tool_usage(state, &request),
        (Method::Get, p) if p.starts_with("/client_tools/") => {
            handle_client_tools_download(state, &request, p)
        }
        _ => json_response(404, json!({"success": false, "error": "Not found"})),
    };

    if let Err(err) = request.respond(response) {
        eprintln!("respond error: {err}");
    }
}

// ── Response and body helpers ────────────────────────────────────────────

fn json_response(status: u16, value: serde_json::Value) -> HttpResponse {
    let mut response = Response::from_string(value.to_string()).with_status_code(status);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response.add_header(header);
    }
    response
}

fn error_response(err: &ToolError) -> HttpResponse {
    json_response(
        err.status_code(),
        json!({"success": false, "error": err.to_string()}),
    )
}

fn not_authenticated() -> HttpResponse {
    json_response(401, json!({"success": false, "error": "Not authenticated"}))
}

fn parse_json_body(request: &mut Request) -> Result<serde_json::Value, String> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|e| format!("read body: {e}"))?;
    if body.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&body).map_err(|e| format!("json: {e}"))
}

fn parse_form_body(request: &mut Request) -> Result<HashMap<String, String>, String> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|e| format!("read body: {e}"))?;
    Ok(form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect())
}

fn session_token_for(request: &Request) -> Option<String> {
    let cookie = request
        .headers()
        .iter()
        .find(|header| header.field.equiv("Cookie"))?;
    token_from_cookie_header(cookie.value.as_str())
}

/// Resolve the caller's principal from the session cookie. User
/// entitlement is re-read from the identity store on every call so a
/// revocation takes effect on the next request.
fn principal_for(state: &ServerState, request: &Request) -> Option<Principal> {
    let token = session_token_for(request)?;
    let session = state.sessions.get(&token)?;
    if session.secret_admin {
        return Some(Principal::Admin {
            username: session.username,
        });
    }
    let db = state.db.lock().unwrap_or_else(|e| e.into_inner());
    let external = db
        .get_user(&session.username)
        .ok()
        .flatten()
        .map(|user| user.external_features)
        .unwrap_or(false);
    Some(Principal::User {
        username: session.username,
        external_features: external,
    })
}

// ── Auth handlers ────────────────────────────────────────────────────────

fn handle_login(state: &ServerState, request: &mut Request) -> HttpResponse {
    let params = match parse_form_body(request) {
        Ok(params) => params,
        Err(err) => return json_response(400, json!({"success": false, "error": err})),
    };
    let username = params.get("username").cloned().unwrap_or_default();
    let password = params.get("password").cloned().unwrap_or_default();

    // Master credential logs in as the admin principal, bypassing the
    // identity store entirely.
    if !state.admin_password.is_empty() && password == state.admin_password {
        let username = if username.trim().is_empty() {
            "admin".to_string()
        } else {
            username
        };
        let token = state.sessions.create(&username, true);
        return login_success(&token);
    }

    let authenticated = {
        let db = state.db.lock().unwrap_or_else(|e| e.into_inner());
        db.authenticate(&username, &password)
    };
    match authenticated {
        Ok(Some(_)) => {
            let token = state.sessions.create(&username, false);
            login_success(&token)
        }
        Ok(None) => json_response(
            401,
            json!({"success": false, "error": "Invalid username or password"}),
        ),
        Err(err) => error_response(&err),
    }
}

fn login_success(token: &str) -> HttpResponse {
    let mut response = Response::from_string("").with_status_code(302);
    if let Ok(header) = Header::from_bytes("Location", "/") {
        response.add_header(header);
    }
    if let Ok(header) = Header::from_bytes("Set-Cookie", session_cookie(token)) {
        response.add_header(header);
    }
    response
}

fn handle_logout(state: &ServerState, request: &Request) -> HttpResponse {
    if let Some(token) = session_token_for(request) {
        state.sessions.remove(&token);
    }
    json_response(200, json!({"success": true}))
}

fn handle_check_external(state: &ServerState, request: &Request) -> HttpResponse {
    let has = principal_for(state, request)
        .map(|principal| principal.is_entitled())
        .unwrap_or(false);
    json_response(200, json!({"has_external_features": has}))
}

// ── Tool discovery and execution ─────────────────────────────────────────

fn handle_list_tools(state: &ServerState, request: &Request) -> HttpResponse {
    let Some(principal) = principal_for(state, request) else {
        return json_response(401, json!({"hasAccess": false, "error": "Not authenticated"}));
    };
    if !principal.is_entitled() {
        return json_response(200, json!({"hasAccess": false, "tools": []}));
    }
    let config = state.registry.load();
    let db = state.db.lock().unwrap_or_else(|e| e.into_inner());
    match state.registry.effective_tools(&config, &db, &principal) {
        Ok(tools) => {
            let server_count = tools
                .iter()
                .filter(|tool| tool.source == ToolSource::Server)
                .count();
            let user_count = tools.len() - server_count;
            json_response(
                200,
                json!({
                    "hasAccess": true,
                    "tools": tools,
                    "username": principal.username(),
                    "server_tools_count": server_count,
                    "user_tools_count": user_count,
                }),
            )
        }
        Err(err) => error_response(&err),
    }
}

fn handle_run_tool(state: &ServerState, request: &mut Request) -> HttpResponse {
    let Some(principal) = principal_for(state, request) else {
        return not_authenticated();
    };
    let payload = match parse_json_body(request) {
        Ok(payload) => payload,
        Err(err) => return json_response(400, json!({"success": false, "error": err})),
    };
    let tool_id = payload.get("toolId").and_then(|v| v.as_str()).unwrap_or("");
    if tool_id.is_empty() {
        return json_response(400, json!({"success": false, "error": "Tool ID required"}));
    }

    let log_dir = log_dir_path(&state.data_dir);
    let db = state.db.lock().unwrap_or_else(|e| e.into_inner());
    let ctx = DispatchContext {
        registry: &state.registry,
        queue: &state.queue,
        db: &db,
        log_dir: Some(&log_dir),
    };
    match execute_tool(&ctx, &principal, tool_id) {
        Ok(descriptor) => {
            let mut value = serde_json::to_value(&descriptor).unwrap_or_else(|_| json!({}));
            if let Some(object) = value.as_object_mut() {
                object.insert("success".to_string(), json!(true));
            }
            json_response(200, value)
        }
        Err(err) => error_response(&err),
    }
}

// ── Client-service queue ─────────────────────────────────────────────────

fn handle_queue_peek(state: &ServerState, request: &Request) -> HttpResponse {
    let Some(principal) = principal_for(state, request) else {
        return not_authenticated();
    };
    if !principal.is_entitled() {
        return error_response(&ToolError::NotEntitled);
    }
    let pending = state.queue.pending(principal.username());
    let count = pending.len();
    json_response(
        200,
        json!({"success": true, "queue": pending, "count": count}),
    )
}

fn handle_queue_post(state: &ServerState, request: &mut Request) -> HttpResponse {
    let Some(principal) = principal_for(state, request) else {
        return not_authenticated();
    };
    if !principal.is_entitled() {
        return error_response(&ToolError::NotEntitled);
    }
    let payload = match parse_json_body(request) {
        Ok(payload) => payload,
        Err(err) => return json_response(400, json!({"success": false, "error": err})),
    };
    let action = payload.get("action").and_then(|v| v.as_str()).unwrap_or("add");
    match action {
        "add" => {
            // Legacy enqueue path: a bare task carrying only the tool id;
            // the executor drives it back through the run endpoint.
            let tool_id = payload
                .get("tool_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if tool_id.is_empty() {
                return json_response(400, json!({"success": false, "error": "Tool ID required"}));
            }
            let task = QueuedCommand {
                id: next_command_id(),
                kind: None,
                command: None,
                tool_id: Some(tool_id.to_string()),
                created: now_iso(),
                status: "pending".to_string(),
            };
            let task_id = task.id.clone();
            state.queue.enqueue(principal.username(), task);
            eprintln!("queued task for {}: {tool_id}", principal.username());
            json_response(
                200,
                json!({"success": true, "task_id": task_id, "message": "Task added to queue"}),
            )
        }
        "complete" => {
            let task_id = payload
                .get("task_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if task_id.is_empty() {
                return json_response(400, json!({"success": false, "error": "Task ID required"}));
            }
            state.queue.complete(principal.username(), task_id);
            json_response(
                200,
                json!({"success": true, "message": "Task marked as completed"}),
            )
        }
        _ => json_response(400, json!({"success": false, "error": "Invalid action"})),
    }
}

// ── Account-scoped user tools ────────────────────────────────────────────

fn handle_account_tools_get(state: &ServerState, request: &Request) -> HttpResponse {
    let Some(principal) = principal_for(state, request) else {
        return not_authenticated();
    };
    let config = state.registry.load();
    let db = state.db.lock().unwrap_or_else(|e| e.into_inner());
    match db.tools_for_user(principal.username()) {
        Ok(records) => {
            let tools: Vec<Tool> = records.iter().map(UserToolRecord::normalize).collect();
            json_response(
                200,
                json!({
                    "success": true,
                    "tools": tools,
                    "max_tools": config.settings.max_user_tools,
                    "allow_user_tools": config.settings.allow_user_tools,
                }),
            )
        }
        Err(err) => error_response(&err),
    }
}

fn handle_account_tools_post(state: &ServerState, request: &mut Request) -> HttpResponse {
    let Some(principal) = principal_for(state, request) else {
        return not_authenticated();
    };
    let config = state.registry.load();
    if !config.settings.allow_user_tools {
        return json_response(
            403,
            json!({"success": false, "error": "User external tools are not enabled on this server"}),
        );
    }
    let payload = match parse_json_body(request) {
        Ok(payload) => payload,
        Err(err) => return json_response(400, json!({"success": false, "error": err})),
    };
    let action = payload.get("action").and_then(|v| v.as_str()).unwrap_or("");
    let db = state.db.lock().unwrap_or_else(|e| e.into_inner());
    match action {
        "add_tool" => {
            let data: UserToolData = match serde_json::from_value(payload.clone()) {
                Ok(data) => data,
                Err(err) => {
                    return json_response(400, json!({"success": false, "error": err.to_string()}));
                }
            };
            if data.tool_id.trim().is_empty() || data.name.trim().is_empty() {
                return json_response(
                    400,
                    json!({"success": false, "error": "Tool ID and name are required"}),
                );
            }
            match state.registry.create_user_tool(&config, &db, &principal, &data) {
                Ok(()) => json_response(
                    200,
                    json!({"success": true, "message": format!("Tool '{}' added successfully", data.name)}),
                ),
                Err(err) => error_response(&err),
            }
        }
        "update_tool" => {
            let data: UserToolData = match serde_json::from_value(payload.clone()) {
                Ok(data) => data,
                Err(err) => {
                    return json_response(400, json!({"success": false, "error": err.to_string()}));
                }
            };
            let tool_id = data.tool_id.clone();
            match state
                .registry
                .update_user_tool(&db, &principal, &tool_id, &data)
            {
                Ok(()) => json_response(
                    200,
                    json!({"success": true, "message": "Tool updated successfully"}),
                ),
                Err(err) => error_response(&err),
            }
        }
        "delete_tool" => {
            let tool_id = payload
                .get("tool_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match state.registry.delete_user_tool(&db, &principal, tool_id) {
                Ok(()) => json_response(
                    200,
                    json!({"success": true, "message": "Tool deleted successfully"}),
                ),
                Err(err) => error_response(&err),
            }
        }
        "toggle_tool" => {
            let tool_id = payload
                .get("tool_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match state.registry.toggle_user_tool(&db, &principal, tool_id) {
                Ok(enabled) => {
                    let verb = if enabled { "enabled" } else { "disabled" };
                    json_response(
                        200,
                        json!({
                            "success": true,
                            "enabled": enabled,
                            "message": format!("Tool {verb} successfully"),
                        }),
                    )
                }
                Err(err) => error_response(&err),
            }
        }
        _ => json_response(400, json!({"success": false, "error": "Invalid action"})),
    }
}

// ── Admin surface ────────────────────────────────────────────────────────

fn require_admin(state: &ServerState, request: &Request) -> Result<Principal, HttpResponse> {
    let Some(principal) = principal_for(state, request) else {
        return Err(not_authenticated());
    };
    if !principal.is_admin() {
        return Err(json_response(
            403,
            json!({"success": false, "error": "Admin access required"}),
        ));
    }
    Ok(principal)
}

fn handle_admin_tools_get(state: &ServerState, request: &Request) -> HttpResponse {
    if let Err(response) = require_admin(state, request) {
        return response;
    }
    json_response(200, json!({"success": true, "config": state.registry.load()}))
}

fn handle_admin_tool_usage(state: &ServerState, request: &Request) -> HttpResponse {
    if let Err(response) = require_admin(state, request) {
        return response;
    }
    let records = load_recent_audit(&log_dir_path(&state.data_dir), 200);
    let count = records.len();
    json_response(
        200,
        json!({"success": true, "records": records, "count": count}),
    )
}

/// Overlay only the keys present in the payload onto the current
/// settings, so a partial update never resets the rest to defaults.
fn overlay_settings(mut settings: ToolSettings, payload: &serde_json::Value) -> ToolSettings {
    if let Some(v) = payload.get("allow_user_tools").and_then(|v| v.as_bool()) {
        settings.allow_user_tools = v;
    }
    if let Some(v) = payload.get("allow_custom_tools").and_then(|v| v.as_bool()) {
        settings.allow_custom_tools = v;
    }
    if let Some(v) = payload
        .get("require_admin_approval")
        .and_then(|v| v.as_bool())
    {
        settings.require_admin_approval = v;
    }
    if let Some(v) = payload.get("log_tool_usage").and_then(|v| v.as_bool()) {
        settings.log_tool_usage = v;
    }
    if let Some(v) = payload.get("max_user_tools").and_then(|v| v.as_u64()) {
        settings.max_user_tools = v as usize;
    }
    settings
}

fn handle_admin_tools_post(state: &ServerState, request: &mut Request) -> HttpResponse {
    if let Err(response) = require_admin(state, request) {
        return response;
    }
    let payload = match parse_json_body(request) {
        Ok(payload) => payload,
        Err(err) => return json_response(400, json!({"success": false, "error": err})),
    };
    let action = payload.get("action").and_then(|v| v.as_str()).unwrap_or("");
    match action {
        "add_tool" => {
            let record: ServerToolRecord = match serde_json::from_value(payload.clone()) {
                Ok(record) => record,
                Err(err) => {
                    return json_response(400, json!({"success": false, "error": err.to_string()}));
                }
            };
            if record.id.trim().is_empty() || record.name.trim().is_empty() {
                return json_response(
                    400,
                    json!({"success": false, "error": "Tool ID and name are required"}),
                );
            }
            let name = record.name.clone();
            match state.registry.add_server_tool(record) {
                Ok(()) => json_response(
                    200,
                    json!({"success": true, "message": format!("Tool {name} added successfully")}),
                ),
                Err(err) => error_response(&err),
            }
        }
        "update_tool" => {
            let tool_id = payload
                .get("tool_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let enabled = payload
                .get("enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let hidden = payload
                .get("hidden")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            match state.registry.update_server_tool(tool_id, enabled, hidden) {
                Ok(()) => json_response(
                    200,
                    json!({"success": true, "message": format!("Tool {tool_id} updated successfully")}),
                ),
                Err(err) => error_response(&err),
            }
        }
        "delete_tool" => {
            let tool_id = payload
                .get("tool_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match state.registry.delete_server_tool(tool_id) {
                Ok(()) => json_response(
                    200,
                    json!({"success": true, "message": format!("Tool {tool_id} deleted successfully")}),
                ),
                Err(err) => error_response(&err),
            }
        }
        "update_settings" => {
            let settings = overlay_settings(state.registry.load().settings, &payload);
            match state.registry.update_settings(settings) {
                Ok(()) => json_response(
                    200,
                    json!({"success": true, "message": "Settings updated successfully"}),
                ),
                Err(err) => error_response(&err),
            }
        }
        _ => json_response(400, json!({"success": false, "error": "Invalid action"})),
    }
}

// ── Companion payload downloads ──────────────────────────────────────────

/// A single path segment with no traversal; anything else is refused.
fn safe_client_tools_name(raw: &str) -> Option<String> {
    let name = urlencoding::decode(raw).ok()?.into_owned();
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return None;
    }
    Some(name)
}

fn handle_client_tools_download(
    state: &ServerState,
    request: &Request,
    path: &str,
) -> HttpResponse {
    let Some(principal) = principal_for(state, request) else {
        return json_response(401, json!({"error": "Not authenticated"}));
    };
    if !principal.is_entitled() {
        return json_response(403, json!({"error": "External features not enabled"}));
    }
    let raw = path.trim_start_matches("/client_tools/");
    let Some(name) = safe_client_tools_name(raw) else {
        return json_response(400, json!({"error": "Invalid filename"}));
    };
    let file_path = client_tools_dir(&state.data_dir).join(&name);
    match std::fs::read(&file_path) {
        Ok(bytes) => {
            let mut response = Response::from_data(bytes);
            if let Ok(header) = Header::from_bytes("Content-Type", "application/octet-stream") {
                response.add_header(header);
            }
            response
        }
        Err(_) => json_response(404, json!({"error": "Not found"})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_names_reject_traversal() {
        assert_eq!(
            safe_client_tools_name("service.py").as_deref(),
            Some("service.py")
        );
        assert_eq!(
            safe_client_tools_name("my%20tool.zip").as_deref(),
            Some("my tool.zip")
        );
        assert!(safe_client_tools_name("").is_none());
        assert!(safe_client_tools_name("..%2Fetc%2Fpasswd").is_none());
        assert!(safe_client_tools_name("a/b").is_none());
        assert!(safe_client_tools_name("..\\secrets").is_none());
    }

    #[test]
    fn overlay_settings_touches_only_present_keys() {
        let base = ToolSettings::default();
        let updated = overlay_settings(
            base.clone(),
            &json!({"max_user_tools": 3, "log_tool_usage": false}),
        );
        assert_eq!(updated.max_user_tools, 3);
        assert!(!updated.log_tool_usage);
        // Untouched keys keep their values.
        assert!(updated.allow_user_tools);
        assert!(updated.allow_custom_tools);

        let unchanged = overlay_settings(base, &json!({}));
        assert_eq!(unchanged.max_user_tools, 10);
    }
}
