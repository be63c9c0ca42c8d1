//! Dispatch Engine: turns a tool-execution request into either an
//! immediate action descriptor or a queued command for the companion
//! agent.

use std::path::Path;

use chrono::Utc;

use crate::{
    ActionDescriptor, AuditRecord, CommandQueue, Instruction, Principal, QueuedCommand, Tool,
    ToolError, ToolKind, ToolRegistry, UserDb, append_audit_jsonl, next_command_id,
};

pub(crate) struct DispatchContext<'a> {
    pub(crate) registry: &'a ToolRegistry,
    pub(crate) queue: &'a CommandQueue,
    pub(crate) db: &'a UserDb,
    /// Audit destination; None disables the JSONL side channel.
    pub(crate) log_dir: Option<&'a Path>,
}

/// Execute one tool for the caller. Deferred modality succeeds as soon
/// as the command is accepted into the queue; everything else returns a
/// descriptor for the caller's own environment.
pub(crate) fn execute_tool(
    ctx: &DispatchContext<'_>,
    caller: &Principal,
    tool_id: &str,
) -> Result<ActionDescriptor, ToolError> {
    if !caller.is_entitled() {
        return Err(ToolError::NotEntitled);
    }
    let config = ctx.registry.load();
    let tool = ctx.registry.resolve(&config, ctx.db, caller, tool_id)?;

    if config.settings.log_tool_usage {
        record_usage(ctx.log_dir, caller, &tool);
    }

    let required = |value: &Option<String>, field: &'static str| -> Result<String, ToolError> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(ToolError::Misconfigured(field))
    };

    match &tool.kind {
        ToolKind::Website => {
            let url = required(&tool.website_url, "Website URL")?;
            Ok(ActionDescriptor::OpenUrl {
                url,
                message: format!("Opening {} in browser", tool.display_name()),
            })
        }
        ToolKind::Protocol => {
            let url = required(&tool.protocol_url, "Protocol URL")?;
            Ok(ActionDescriptor::Protocol {
                url,
                message: format!("Launching {} via protocol", tool.display_name()),
            })
        }
        ToolKind::ClientService => {
            // Fall back to the raw tool id when no launch target is
            // configured; the executor decides what that means.
            let executable = tool
                .executable_path
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(&tool.id)
                .to_string();
            let instruction = Instruction::ToolLaunch {
                tool_id: tool.id.clone(),
                executable,
            };
            let command = QueuedCommand {
                id: next_command_id(),
                kind: Some("command".to_string()),
                command: Some(instruction.encode()),
                tool_id: None,
                created: Utc::now().to_rfc3339(),
                status: "pending".to_string(),
            };
            let command_id = command.id.clone();
            ctx.queue.enqueue(caller.username(), command);
            Ok(ActionDescriptor::ClientService {
                tool_id: tool.id.clone(),
                command_id,
                message: format!(
                    "Tool {} queued for client service execution",
                    tool.display_name()
                ),
            })
        }
        ToolKind::Executable | ToolKind::Script => {
            // Descriptor only; nothing runs server-side.
            let executable = required(&tool.executable_path, "Executable path")?;
            Ok(ActionDescriptor::Execute {
                executable,
                message: format!("Tool {} execution requested", tool.display_name()),
            })
        }
        ToolKind::Other(raw) => Err(ToolError::UnknownToolType(raw.clone())),
    }
}

fn record_usage(log_dir: Option<&Path>, caller: &Principal, tool: &Tool) {
    eprintln!(
        "user {} executed {} tool: {} (type: {})",
        caller.username(),
        tool.source.label(),
        tool.id,
        tool.kind
    );
    let Some(log_dir) = log_dir else {
        return;
    };
    let record = AuditRecord {
        ts_utc: Utc::now().to_rfc3339(),
        username: caller.username().to_string(),
        tool_id: tool.id.clone(),
        source: tool.source.label().to_string(),
        kind: tool.kind.as_str().to_string(),
    };
    if let Err(err) = append_audit_jsonl(log_dir, &record) {
        eprintln!("audit write failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServerToolRecord, UserDb};
    use std::path::PathBuf;

    fn temp_path(name: &str, ext: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("toolshed_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("dispatch_{}_{name}.{ext}", std::process::id()))
    }

    struct Fixture {
        registry: ToolRegistry,
        queue: CommandQueue,
        db: UserDb,
        config_path: PathBuf,
        db_path: PathBuf,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let config_path = temp_path(name, "json");
            let db_path = temp_path(name, "sqlite");
            let _ = std::fs::remove_file(&config_path);
            let _ = std::fs::remove_file(&db_path);
            Self {
                registry: ToolRegistry::new(config_path.clone()),
                queue: CommandQueue::new(),
                db: UserDb::open_or_create(&db_path).unwrap(),
                config_path,
                db_path,
            }
        }

        fn ctx(&self) -> DispatchContext<'_> {
            DispatchContext {
                registry: &self.registry,
                queue: &self.queue,
                db: &self.db,
                log_dir: None,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_file(&self.config_path).ok();
            std::fs::remove_file(&self.db_path).ok();
        }
    }

    fn entitled(username: &str) -> Principal {
        Principal::User {
            username: username.to_string(),
            external_features: true,
        }
    }

    fn server_tool(id: &str, kind: &str) -> ServerToolRecord {
        ServerToolRecord {
            id: id.to_string(),
            name: "Calculator".to_string(),
            kind: kind.to_string(),
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn client_service_round_trip_through_queue() {
        let fixture = Fixture::new("e2e");
        let mut tool = server_tool("t1", "client_service");
        tool.executable = Some("calc.exe".to_string());
        fixture.registry.add_server_tool(tool).unwrap();

        let caller = entitled("alice");
        let descriptor = execute_tool(&fixture.ctx(), &caller, "t1").unwrap();
        let ActionDescriptor::ClientService {
            tool_id,
            command_id,
            ..
        } = descriptor
        else {
            panic!("expected client_service descriptor");
        };
        assert_eq!(tool_id, "t1");
        assert!(!command_id.is_empty());

        let pending = fixture.queue.pending("alice");
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].command.as_deref(),
            Some("cmd|tool|t1|calc.exe|launch")
        );
        assert_eq!(pending[0].status, "pending");

        fixture.queue.complete("alice", &command_id);
        assert!(fixture.queue.pending("alice").is_empty());
    }

    #[test]
    fn client_service_falls_back_to_tool_id() {
        let fixture = Fixture::new("fallback");
        fixture
            .registry
            .add_server_tool(server_tool("standalone-thing", "client_service"))
            .unwrap();

        let caller = entitled("alice");
        execute_tool(&fixture.ctx(), &caller, "standalone-thing").unwrap();
        let pending = fixture.queue.pending("alice");
        assert_eq!(
            pending[0].command.as_deref(),
            Some("cmd|tool|standalone-thing|standalone-thing|launch")
        );
    }

    #[test]
    fn unentitled_caller_is_refused_before_resolution() {
        let fixture = Fixture::new("refused");
        fixture
            .registry
            .add_server_tool(server_tool("t1", "client_service"))
            .unwrap();

        let caller = Principal::User {
            username: "bob".to_string(),
            external_features: false,
        };
        assert!(matches!(
            execute_tool(&fixture.ctx(), &caller, "t1"),
            Err(ToolError::NotEntitled)
        ));
        // Even for tools that do not exist.
        assert!(matches!(
            execute_tool(&fixture.ctx(), &caller, "ghost"),
            Err(ToolError::NotEntitled)
        ));
        assert!(fixture.queue.pending("bob").is_empty());
    }

    #[test]
    fn admin_principal_bypasses_entitlement() {
        let fixture = Fixture::new("admin");
        fixture
            .registry
            .add_server_tool(server_tool("t1", "client_service"))
            .unwrap();
        let admin = Principal::Admin {
            username: "admin".to_string(),
        };
        assert!(execute_tool(&fixture.ctx(), &admin, "t1").is_ok());
    }

    #[test]
    fn hidden_tools_execute_but_do_not_list() {
        let fixture = Fixture::new("hidden");
        let mut tool = server_tool("secret", "website");
        tool.website_url = Some("https://secret.example".to_string());
        tool.hidden = true;
        fixture.registry.add_server_tool(tool).unwrap();

        let caller = entitled("alice");
        let config = fixture.registry.load();
        let listed = fixture
            .registry
            .effective_tools(&config, &fixture.db, &caller)
            .unwrap();
        assert!(listed.iter().all(|t| t.id != "secret"));

        let descriptor = execute_tool(&fixture.ctx(), &caller, "secret").unwrap();
        assert!(matches!(descriptor, ActionDescriptor::OpenUrl { .. }));
    }

    #[test]
    fn website_without_url_is_misconfigured() {
        let fixture = Fixture::new("misconfigured");
        // Bypass creation validation: write the document directly, as a
        // hand-edited config would.
        let mut config = fixture.registry.load();
        config.server_tools.push(ServerToolRecord {
            id: "broken".to_string(),
            kind: "website".to_string(),
            enabled: true,
            ..Default::default()
        });
        crate::save_tools_config(&fixture.config_path, &config).unwrap();

        let caller = entitled("alice");
        assert!(matches!(
            execute_tool(&fixture.ctx(), &caller, "broken"),
            Err(ToolError::Misconfigured("Website URL"))
        ));
    }

    #[test]
    fn executable_returns_descriptor_only() {
        let fixture = Fixture::new("descriptor");
        let mut tool = server_tool("np", "executable");
        tool.executable = Some("notepad.exe".to_string());
        fixture.registry.add_server_tool(tool).unwrap();

        let caller = entitled("alice");
        let descriptor = execute_tool(&fixture.ctx(), &caller, "np").unwrap();
        let ActionDescriptor::Execute { executable, .. } = descriptor else {
            panic!("expected execute descriptor");
        };
        assert_eq!(executable, "notepad.exe");
        // Nothing was queued; the server ran nothing.
        assert!(fixture.queue.pending("alice").is_empty());
    }

    #[test]
    fn unknown_kind_fails_at_dispatch() {
        let fixture = Fixture::new("unknown");
        let mut config = fixture.registry.load();
        config.server_tools.push(ServerToolRecord {
            id: "odd".to_string(),
            kind: "hologram".to_string(),
            enabled: true,
            ..Default::default()
        });
        crate::save_tools_config(&fixture.config_path, &config).unwrap();

        let caller = entitled("alice");
        assert!(matches!(
            execute_tool(&fixture.ctx(), &caller, "odd"),
            Err(ToolError::UnknownToolType(_))
        ));
    }

    #[test]
    fn missing_tool_is_not_found() {
        let fixture = Fixture::new("missing");
        let caller = entitled("alice");
        assert!(matches!(
            execute_tool(&fixture.ctx(), &caller, "ghost"),
            Err(ToolError::ToolNotFound)
        ));
    }
}
