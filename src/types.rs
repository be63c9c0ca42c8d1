use serde::{Deserialize, Serialize, Serializer};

// ── Tool kind ────────────────────────────────────────────────────────────

/// Dispatch modality of a tool. Unrecognized strings survive loading
/// (`Other`) so a stale configuration document still lists; they are
/// rejected only when executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub(crate) enum ToolKind {
    Executable,
    Script,
    Website,
    Protocol,
    ClientService,
    Other(String),
}

impl ToolKind {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::Executable => "executable",
            Self::Script => "script",
            Self::Website => "website",
            Self::Protocol => "protocol",
            Self::ClientService => "client_service",
            Self::Other(raw) => raw,
        }
    }

    pub(crate) fn parse(raw: &str) -> Self {
        match raw {
            "executable" => Self::Executable,
            "script" => Self::Script,
            "website" => Self::Website,
            "protocol" => Self::Protocol,
            "client_service" => Self::ClientService,
            other => Self::Other(other.to_string()),
        }
    }

    pub(crate) fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for ToolKind {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<ToolKind> for String {
    fn from(kind: ToolKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tool (canonical shape) ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ToolSource {
    Server,
    User(String),
}

impl ToolSource {
    /// Short label used by audit records and log lines.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::User(_) => "user",
        }
    }
}

impl Serialize for ToolSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Server => serializer.serialize_str("server"),
            Self::User(username) => serializer.serialize_str(username),
        }
    }
}

/// One canonical tool shape, produced by the registry's ingestion
/// boundary from either a server configuration record or a user row.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Tool {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) icon: String,
    #[serde(rename = "type")]
    pub(crate) kind: ToolKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) executable_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) website_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) protocol_url: Option<String>,
    pub(crate) enabled: bool,
    pub(crate) hidden: bool,
    pub(crate) source: ToolSource,
}

impl Tool {
    /// Display name for user-facing messages, falling back to the id.
    pub(crate) fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

fn default_icon() -> String {
    "bi bi-gear".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_user_tools() -> usize {
    10
}

fn default_enabled_flag() -> i64 {
    1
}

// ── Server tool record (config-document shape) ───────────────────────────

/// Tool entry as persisted in the server configuration document. The
/// document's historical field name for the launch target is
/// `executable`; normalization maps it onto `executable_path`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ServerToolRecord {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default = "default_icon")]
    pub(crate) icon: String,
    #[serde(rename = "type", default)]
    pub(crate) kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) website_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) protocol_url: Option<String>,
    #[serde(default)]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) hidden: bool,
}

impl ServerToolRecord {
    pub(crate) fn normalize(&self) -> Tool {
        Tool {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            icon: self.icon.clone(),
            kind: ToolKind::parse(&self.kind),
            executable_path: self.executable.clone(),
            website_url: self.website_url.clone(),
            protocol_url: self.protocol_url.clone(),
            enabled: self.enabled,
            hidden: self.hidden,
            source: ToolSource::Server,
        }
    }
}

// ── User tool record (relational-row shape) ──────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct UserToolRecord {
    pub(crate) username: String,
    pub(crate) tool_id: String,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) icon: String,
    pub(crate) kind: String,
    pub(crate) executable_path: Option<String>,
    pub(crate) website_url: Option<String>,
    pub(crate) protocol_url: Option<String>,
    pub(crate) parameters: Option<String>,
    pub(crate) is_enabled: bool,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl UserToolRecord {
    pub(crate) fn normalize(&self) -> Tool {
        Tool {
            id: self.tool_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            icon: self.icon.clone(),
            kind: ToolKind::parse(&self.kind),
            executable_path: self.executable_path.clone(),
            website_url: self.website_url.clone(),
            protocol_url: self.protocol_url.clone(),
            enabled: self.is_enabled,
            hidden: false,
            source: ToolSource::User(self.username.clone()),
        }
    }
}

/// Incoming payload for creating or updating a user tool.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UserToolData {
    #[serde(default)]
    pub(crate) tool_id: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default = "default_icon")]
    pub(crate) icon: String,
    #[serde(rename = "type", default)]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) executable_path: Option<String>,
    #[serde(default)]
    pub(crate) website_url: Option<String>,
    #[serde(default)]
    pub(crate) protocol_url: Option<String>,
    #[serde(default)]
    pub(crate) parameters: Option<String>,
    #[serde(default = "default_enabled_flag")]
    pub(crate) is_enabled: i64,
}

// ── Settings / configuration document ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ToolSettings {
    #[serde(default = "default_true")]
    pub(crate) allow_custom_tools: bool,
    #[serde(default = "default_true")]
    pub(crate) allow_user_tools: bool,
    #[serde(default)]
    pub(crate) require_admin_approval: bool,
    #[serde(default = "default_true")]
    pub(crate) log_tool_usage: bool,
    #[serde(default = "default_max_user_tools")]
    pub(crate) max_user_tools: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            allow_custom_tools: true,
            allow_user_tools: true,
            require_admin_approval: false,
            log_tool_usage: true,
            max_user_tools: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ToolsConfig {
    #[serde(default)]
    pub(crate) server_tools: Vec<ServerToolRecord>,
    #[serde(default)]
    pub(crate) settings: ToolSettings,
}

// ── Principal ────────────────────────────────────────────────────────────

/// Authenticated caller. The master-credential admin is a distinct
/// principal type, not a flag on a user session, so entitlement is a
/// single predicate.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Principal {
    Admin { username: String },
    User { username: String, external_features: bool },
}

impl Principal {
    pub(crate) fn username(&self) -> &str {
        match self {
            Self::Admin { username } | Self::User { username, .. } => username,
        }
    }

    pub(crate) fn is_admin(&self) -> bool {
        matches!(self, Self::Admin { .. })
    }

    pub(crate) fn is_entitled(&self) -> bool {
        match self {
            Self::Admin { .. } => true,
            Self::User {
                external_features, ..
            } => *external_features,
        }
    }
}

// ── Queue entry ──────────────────────────────────────────────────────────

/// One pending entry in a user's command queue. Entries carrying an
/// encoded instruction have `kind = "command"`; the legacy enqueue path
/// produces bare entries with only a `tool_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QueuedCommand {
    pub(crate) id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub(crate) kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tool_id: Option<String>,
    pub(crate) created: String,
    pub(crate) status: String,
}

// ── Action descriptor ────────────────────────────────────────────────────

/// Synchronous outcome of a dispatch. `client_service` is the only
/// deferred modality; the others describe an action for the caller's
/// own environment.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub(crate) enum ActionDescriptor {
    OpenUrl {
        url: String,
        message: String,
    },
    Protocol {
        url: String,
        message: String,
    },
    ClientService {
        tool_id: String,
        command_id: String,
        message: String,
    },
    Execute {
        executable: String,
        message: String,
    },
}

// ── Identity records ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub(crate) struct UserRecord {
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) external_features: bool,
    pub(crate) created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_login: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct NewUser {
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) password: String,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) external_features: bool,
}
