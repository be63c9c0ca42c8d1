//! SQLite-backed identity and user-tools store.
//!
//! Holds the portal accounts (with the per-user external-features
//! entitlement) and each user's private tool definitions, keyed by
//! `(username, tool_id)`. WAL mode so the agent's polling never blocks
//! interactive requests on reads.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    NewUser, ToolError, UserRecord, UserToolData, UserToolRecord, hash_password, now_iso,
    verify_password,
};

pub(crate) struct UserDb {
    conn: Connection,
}

// ── Schema SQL ───────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    email TEXT UNIQUE NOT NULL,
    password TEXT NOT NULL,
    first_name TEXT DEFAULT '',
    last_name TEXT DEFAULT '',
    created_at TEXT,
    updated_at TEXT,
    last_login TEXT,
    external_features INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_external_tools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    tool_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT DEFAULT '',
    icon TEXT DEFAULT 'bi bi-gear',
    type TEXT NOT NULL CHECK (type IN ('executable', 'script', 'website', 'protocol', 'client_service')),
    executable_path TEXT,
    website_url TEXT,
    protocol_url TEXT,
    parameters TEXT,
    is_enabled INTEGER DEFAULT 1,
    created_at TEXT,
    updated_at TEXT,
    UNIQUE(username, tool_id)
);

CREATE INDEX IF NOT EXISTS idx_user_tools_username ON user_external_tools(username);
";

impl UserDb {
    /// Open or create the database file with full schema.
    pub(crate) fn open_or_create(path: &Path) -> Result<Self, ToolError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ToolError::Persistence(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.apply_pragmas()?;
        db.init_schema()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> Result<(), ToolError> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn init_schema(&self) -> Result<(), ToolError> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Identity operations ──────────────────────────────────────────

    pub(crate) fn create_user(&self, user: &NewUser) -> Result<(), ToolError> {
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO users
                 (username, email, password, first_name, last_name,
                  created_at, updated_at, external_features)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    user.username,
                    user.email,
                    hash_password(&user.password),
                    user.first_name,
                    user.last_name,
                    now,
                    now,
                    user.external_features as i64,
                ],
            )
            .map_err(|e| ToolError::Persistence(format!("create user: {e}")))?;
        Ok(())
    }

    /// Verify credentials; on success stamps `last_login` and returns
    /// the account record.
    pub(crate) fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, ToolError> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT password FROM users WHERE username = ?",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        if !verify_password(password, &stored) {
            return Ok(None);
        }
        self.conn.execute(
            "UPDATE users SET last_login = ? WHERE username = ?",
            params![now_iso(), username],
        )?;
        self.get_user(username)
    }

    pub(crate) fn get_user(&self, username: &str) -> Result<Option<UserRecord>, ToolError> {
        self.conn
            .query_row(
                "SELECT username, email, first_name, last_name,
                        external_features, created_at, last_login
                 FROM users WHERE username = ?",
                params![username],
                Self::row_to_user,
            )
            .optional()
            .map_err(Into::into)
    }

    pub(crate) fn list_users(&self) -> Result<Vec<UserRecord>, ToolError> {
        let mut statement = self.conn.prepare(
            "SELECT username, email, first_name, last_name,
                    external_features, created_at, last_login
             FROM users ORDER BY username",
        )?;
        let rows = statement.query_map([], Self::row_to_user)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Returns false when no such account exists.
    pub(crate) fn set_external_features(
        &self,
        username: &str,
        enabled: bool,
    ) -> Result<bool, ToolError> {
        let affected = self.conn.execute(
            "UPDATE users SET external_features = ?, updated_at = ? WHERE username = ?",
            params![enabled as i64, now_iso(), username],
        )?;
        Ok(affected > 0)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
        Ok(UserRecord {
            username: row.get("username")?,
            email: row.get("email")?,
            first_name: row.get::<_, Option<String>>("first_name")?.unwrap_or_default(),
            last_name: row.get::<_, Option<String>>("last_name")?.unwrap_or_default(),
            external_features: row.get::<_, i64>("external_features")? == 1,
            created_at: row.get::<_, Option<String>>("created_at")?.unwrap_or_default(),
            last_login: row.get("last_login")?,
        })
    }

    // ── User tool operations ─────────────────────────────────────────

    pub(crate) fn insert_tool(
        &self,
        username: &str,
        data: &UserToolData,
    ) -> Result<(), ToolError> {
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO user_external_tools
                 (username, tool_id, name, description, icon, type, executable_path,
                  website_url, protocol_url, parameters, is_enabled, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    username,
                    data.tool_id,
                    data.name,
                    data.description,
                    data.icon,
                    data.kind,
                    data.executable_path,
                    data.website_url,
                    data.protocol_url,
                    data.parameters,
                    data.is_enabled,
                    now,
                    now,
                ],
            )
            .map_err(|e| ToolError::Persistence(format!("create tool: {e}")))?;
        Ok(())
    }

    pub(crate) fn tools_for_user(&self, username: &str) -> Result<Vec<UserToolRecord>, ToolError> {
        let mut statement = self.conn.prepare(
            "SELECT username, tool_id, name, description, icon, type, executable_path,
                    website_url, protocol_url, parameters, is_enabled, created_at, updated_at
             FROM user_external_tools WHERE username = ? ORDER BY name",
        )?;
        let rows = statement.query_map(params![username], Self::row_to_tool)?;
        let mut tools = Vec::new();
        for row in rows {
            tools.push(row?);
        }
        Ok(tools)
    }

    pub(crate) fn get_tool(
        &self,
        username: &str,
        tool_id: &str,
    ) -> Result<Option<UserToolRecord>, ToolError> {
        self.conn
            .query_row(
                "SELECT username, tool_id, name, description, icon, type, executable_path,
                        website_url, protocol_url, parameters, is_enabled, created_at, updated_at
                 FROM user_external_tools WHERE username = ? AND tool_id = ?",
                params![username, tool_id],
                Self::row_to_tool,
            )
            .optional()
            .map_err(Into::into)
    }

    pub(crate) fn count_tools(&self, username: &str) -> Result<usize, ToolError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_external_tools WHERE username = ?",
            params![username],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Returns false when no matching `(username, tool_id)` row exists.
    pub(crate) fn update_tool(
        &self,
        username: &str,
        tool_id: &str,
        data: &UserToolData,
    ) -> Result<bool, ToolError> {
        let affected = self.conn.execute(
            "UPDATE user_external_tools
             SET name = ?, description = ?, icon = ?, type = ?, executable_path = ?,
                 website_url = ?, protocol_url = ?, parameters = ?, is_enabled = ?, updated_at = ?
             WHERE username = ? AND tool_id = ?",
            params![
                data.name,
                data.description,
                data.icon,
                data.kind,
                data.executable_path,
                data.website_url,
                data.protocol_url,
                data.parameters,
                data.is_enabled,
                now_iso(),
                username,
                tool_id,
            ],
        )?;
        Ok(affected > 0)
    }

    pub(crate) fn delete_tool(&self, username: &str, tool_id: &str) -> Result<bool, ToolError> {
        let affected = self.conn.execute(
            "DELETE FROM user_external_tools WHERE username = ? AND tool_id = ?",
            params![username, tool_id],
        )?;
        Ok(affected > 0)
    }

    /// Flip the enabled flag; returns the new state, or None when the
    /// row does not exist.
    pub(crate) fn toggle_tool(
        &self,
        username: &str,
        tool_id: &str,
    ) -> Result<Option<bool>, ToolError> {
        let current: Option<i64> = self
            .conn
            .query_row(
                "SELECT is_enabled FROM user_external_tools WHERE username = ? AND tool_id = ?",
                params![username, tool_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };
        let next = if current == 0 { 1i64 } else { 0i64 };
        self.conn.execute(
            "UPDATE user_external_tools SET is_enabled = ?, updated_at = ?
             WHERE username = ? AND tool_id = ?",
            params![next, now_iso(), username, tool_id],
        )?;
        Ok(Some(next == 1))
    }

    fn row_to_tool(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserToolRecord> {
        Ok(UserToolRecord {
            username: row.get("username")?,
            tool_id: row.get("tool_id")?,
            name: row.get("name")?,
            description: row.get::<_, Option<String>>("description")?.unwrap_or_default(),
            icon: row.get::<_, Option<String>>("icon")?.unwrap_or_default(),
            kind: row.get("type")?,
            executable_path: row.get("executable_path")?,
            website_url: row.get("website_url")?,
            protocol_url: row.get("protocol_url")?,
            parameters: row.get("parameters")?,
            is_enabled: row.get::<_, i64>("is_enabled")? == 1,
            created_at: row.get::<_, Option<String>>("created_at")?.unwrap_or_default(),
            updated_at: row.get::<_, Option<String>>("updated_at")?.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("toolshed_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("userdb_{}_{name}.sqlite", std::process::id()))
    }

    fn sample_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: "hunter2".to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            external_features: false,
        }
    }

    fn sample_tool(tool_id: &str) -> UserToolData {
        UserToolData {
            tool_id: tool_id.to_string(),
            name: tool_id.to_uppercase(),
            description: String::new(),
            icon: "bi bi-gear".to_string(),
            kind: "website".to_string(),
            executable_path: None,
            website_url: Some("https://example.com".to_string()),
            protocol_url: None,
            parameters: None,
            is_enabled: 1,
        }
    }

    #[test]
    fn authenticate_checks_password_and_stamps_login() {
        let path = temp_db_path("auth");
        let _ = std::fs::remove_file(&path);
        let db = UserDb::open_or_create(&path).unwrap();
        db.create_user(&sample_user("alice")).unwrap();

        assert!(db.authenticate("alice", "wrong").unwrap().is_none());
        assert!(db.authenticate("nobody", "hunter2").unwrap().is_none());

        let record = db.authenticate("alice", "hunter2").unwrap().unwrap();
        assert_eq!(record.username, "alice");
        assert!(record.last_login.is_some());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn duplicate_username_is_a_persistence_error() {
        let path = temp_db_path("dup_user");
        let _ = std::fs::remove_file(&path);
        let db = UserDb::open_or_create(&path).unwrap();
        db.create_user(&sample_user("alice")).unwrap();
        let mut clone = sample_user("alice");
        clone.email = "other@example.com".to_string();
        assert!(matches!(
            db.create_user(&clone),
            Err(ToolError::Persistence(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn external_features_flag_round_trips() {
        let path = temp_db_path("entitlement");
        let _ = std::fs::remove_file(&path);
        let db = UserDb::open_or_create(&path).unwrap();
        db.create_user(&sample_user("alice")).unwrap();

        assert!(!db.get_user("alice").unwrap().unwrap().external_features);
        assert!(db.set_external_features("alice", true).unwrap());
        assert!(db.get_user("alice").unwrap().unwrap().external_features);
        assert!(!db.set_external_features("ghost", true).unwrap());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn tool_rows_are_scoped_and_ordered_by_name() {
        let path = temp_db_path("tool_scope");
        let _ = std::fs::remove_file(&path);
        let db = UserDb::open_or_create(&path).unwrap();

        db.insert_tool("alice", &sample_tool("zeta")).unwrap();
        db.insert_tool("alice", &sample_tool("alpha")).unwrap();
        db.insert_tool("bob", &sample_tool("alpha")).unwrap();

        let tools = db.tools_for_user("alice").unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool_id, "alpha");
        assert_eq!(tools[1].tool_id, "zeta");
        assert_eq!(db.count_tools("bob").unwrap(), 1);

        // Same tool_id under a different owner is a separate row.
        assert!(db.get_tool("bob", "alpha").unwrap().is_some());
        assert!(db.get_tool("bob", "zeta").unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn duplicate_tool_id_per_user_is_rejected() {
        let path = temp_db_path("dup_tool");
        let _ = std::fs::remove_file(&path);
        let db = UserDb::open_or_create(&path).unwrap();

        db.insert_tool("alice", &sample_tool("calc")).unwrap();
        assert!(db.insert_tool("alice", &sample_tool("calc")).is_err());
        // ...but fine for another user.
        db.insert_tool("bob", &sample_tool("calc")).unwrap();

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn toggle_update_delete_report_missing_rows() {
        let path = temp_db_path("mutations");
        let _ = std::fs::remove_file(&path);
        let db = UserDb::open_or_create(&path).unwrap();

        db.insert_tool("alice", &sample_tool("calc")).unwrap();
        assert_eq!(db.toggle_tool("alice", "calc").unwrap(), Some(false));
        assert_eq!(db.toggle_tool("alice", "calc").unwrap(), Some(true));
        assert_eq!(db.toggle_tool("alice", "ghost").unwrap(), None);

        let mut update = sample_tool("calc");
        update.name = "Calculator".to_string();
        assert!(db.update_tool("alice", "calc", &update).unwrap());
        assert!(!db.update_tool("bob", "calc", &update).unwrap());

        assert!(db.delete_tool("alice", "calc").unwrap());
        assert!(!db.delete_tool("alice", "calc").unwrap());

        std::fs::remove_file(&path).ok();
    }
}
