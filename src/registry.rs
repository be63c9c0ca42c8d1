//! Tool Registry: merges the admin-curated server tools (JSON document)
//! with the caller's private tools (relational rows) into one canonical
//! list. The two source shapes never leave this module un-normalized.

use std::path::PathBuf;

use crate::{
    Principal, ServerToolRecord, Tool, ToolError, ToolKind, ToolSettings, ToolsConfig,
    UserDb, UserToolData, load_tools_config, save_tools_config,
};

pub(crate) struct ToolRegistry {
    config_path: PathBuf,
}

/// Check the declared kind's required field. Empty and whitespace-only
/// values count as missing.
pub(crate) fn validate_tool_fields(
    kind: &str,
    executable_path: Option<&str>,
    website_url: Option<&str>,
    protocol_url: Option<&str>,
) -> Result<(), ToolError> {
    let present = |value: Option<&str>| value.map(str::trim).is_some_and(|v| !v.is_empty());
    match ToolKind::parse(kind) {
        ToolKind::Website => {
            if !present(website_url) {
                return Err(ToolError::Misconfigured("Website URL"));
            }
        }
        ToolKind::Executable | ToolKind::Script => {
            if !present(executable_path) {
                return Err(ToolError::Misconfigured("Executable path"));
            }
        }
        ToolKind::Protocol => {
            if !present(protocol_url) {
                return Err(ToolError::Misconfigured("Protocol URL"));
            }
        }
        ToolKind::ClientService => {}
        ToolKind::Other(raw) => return Err(ToolError::UnknownToolType(raw)),
    }
    Ok(())
}

impl ToolRegistry {
    pub(crate) fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub(crate) fn load(&self) -> ToolsConfig {
        load_tools_config(&self.config_path)
    }

    // ── Discovery / resolution ───────────────────────────────────────

    /// The tool list a caller sees: enabled, non-hidden server tools
    /// first, then the caller's own enabled tools when user tools are
    /// allowed. Insertion order within each half is preserved.
    pub(crate) fn effective_tools(
        &self,
        config: &ToolsConfig,
        db: &UserDb,
        caller: &Principal,
    ) -> Result<Vec<Tool>, ToolError> {
        if !caller.is_entitled() {
            return Err(ToolError::NotEntitled);
        }
        let mut tools: Vec<Tool> = config
            .server_tools
            .iter()
            .filter(|record| record.enabled && !record.hidden)
            .map(ServerToolRecord::normalize)
            .collect();
        if config.settings.allow_user_tools {
            for record in db.tools_for_user(caller.username())? {
                if record.is_enabled {
                    tools.push(record.normalize());
                }
            }
        }
        Ok(tools)
    }

    /// Resolve a tool id for execution: enabled server tools first
    /// (hidden ones stay executable, they are only absent from
    /// discovery), then the caller's own rows. Never another user's.
    pub(crate) fn resolve(
        &self,
        config: &ToolsConfig,
        db: &UserDb,
        caller: &Principal,
        tool_id: &str,
    ) -> Result<Tool, ToolError> {
        for record in &config.server_tools {
            if record.id == tool_id && record.enabled {
                return Ok(record.normalize());
            }
        }
        if let Some(record) = db.get_tool(caller.username(), tool_id)? {
            if record.is_enabled {
                return Ok(record.normalize());
            }
        }
        Err(ToolError::ToolNotFound)
    }

    // ── User tool mutations (scoped to the caller) ───────────────────

    pub(crate) fn create_user_tool(
        &self,
        config: &ToolsConfig,
        db: &UserDb,
        caller: &Principal,
        data: &UserToolData,
    ) -> Result<(), ToolError> {
        if db.count_tools(caller.username())? >= config.settings.max_user_tools {
            return Err(ToolError::LimitExceeded(config.settings.max_user_tools));
        }
        if db.get_tool(caller.username(), &data.tool_id)?.is_some() {
            return Err(ToolError::DuplicateId(data.tool_id.clone()));
        }
        validate_tool_fields(
            &data.kind,
            data.executable_path.as_deref(),
            data.website_url.as_deref(),
            data.protocol_url.as_deref(),
        )?;
        db.insert_tool(caller.username(), data)
    }

    pub(crate) fn update_user_tool(
        &self,
        db: &UserDb,
        caller: &Principal,
        tool_id: &str,
        data: &UserToolData,
    ) -> Result<(), ToolError> {
        validate_tool_fields(
            &data.kind,
            data.executable_path.as_deref(),
            data.website_url.as_deref(),
            data.protocol_url.as_deref(),
        )?;
        if db.update_tool(caller.username(), tool_id, data)? {
            Ok(())
        } else {
            Err(ToolError::ToolNotFound)
        }
    }

    pub(crate) fn delete_user_tool(
        &self,
        db: &UserDb,
        caller: &Principal,
        tool_id: &str,
    ) -> Result<(), ToolError> {
        if db.delete_tool(caller.username(), tool_id)? {
            Ok(())
        } else {
            Err(ToolError::ToolNotFound)
        }
    }

    /// Returns the new enabled state.
    pub(crate) fn toggle_user_tool(
        &self,
        db: &UserDb,
        caller: &Principal,
        tool_id: &str,
    ) -> Result<bool, ToolError> {
        db.toggle_tool(caller.username(), tool_id)?
            .ok_or(ToolError::ToolNotFound)
    }

    // ── Admin mutations (whole-document rewrites) ────────────────────

    pub(crate) fn add_server_tool(&self, record: ServerToolRecord) -> Result<(), ToolError> {
        validate_tool_fields(
            &record.kind,
            record.executable.as_deref(),
            record.website_url.as_deref(),
            record.protocol_url.as_deref(),
        )?;
        let mut config = self.load();
        if config.server_tools.iter().any(|tool| tool.id == record.id) {
            return Err(ToolError::DuplicateId(record.id));
        }
        config.server_tools.push(record);
        save_tools_config(&self.config_path, &config)
    }

    /// Flip the listing flags of an existing server tool.
    pub(crate) fn update_server_tool(
        &self,
        tool_id: &str,
        enabled: bool,
        hidden: bool,
    ) -> Result<(), ToolError> {
        let mut config = self.load();
        let Some(tool) = config
            .server_tools
            .iter_mut()
            .find(|tool| tool.id == tool_id)
        else {
            return Err(ToolError::ToolNotFound);
        };
        tool.enabled = enabled;
        tool.hidden = hidden;
        save_tools_config(&self.config_path, &config)
    }

    pub(crate) fn delete_server_tool(&self, tool_id: &str) -> Result<(), ToolError> {
        let mut config = self.load();
        let before = config.server_tools.len();
        config.server_tools.retain(|tool| tool.id != tool_id);
        if config.server_tools.len() == before {
            return Err(ToolError::ToolNotFound);
        }
        save_tools_config(&self.config_path, &config)
    }

    pub(crate) fn update_settings(&self, settings: ToolSettings) -> Result<(), ToolError> {
        let mut config = self.load();
        config.settings = settings;
        save_tools_config(&self.config_path, &config)
    }
}
