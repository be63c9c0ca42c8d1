//! Wire encoding for queued commands.
//!
//! The format is pipe-delimited with no escaping: a `|` inside a field
//! breaks the framing, a known limitation of the protocol, preserved
//! for compatibility. The raw string never travels past this
//! module: dispatch encodes, the executor decodes, and everything in
//! between handles an opaque string.

/// Configured launch target meaning "nothing to spawn"; the executor
/// logs the launch and reports success.
pub(crate) const STANDALONE_EXECUTABLE: &str = "standalone";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Instruction {
    /// `cmd|tool|<tool_id>|<executable>|launch`
    ToolLaunch { tool_id: String, executable: String },
    /// `cmd|system|<command...>`, remaining segments rejoined verbatim.
    System { command_line: String },
}

impl Instruction {
    pub(crate) fn encode(&self) -> String {
        match self {
            Self::ToolLaunch {
                tool_id,
                executable,
            } => format!("cmd|tool|{tool_id}|{executable}|launch"),
            Self::System { command_line } => format!("cmd|system|{command_line}"),
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, String> {
        let parts: Vec<&str> = raw.split('|').collect();
        if parts.len() < 3 || parts[0] != "cmd" {
            return Err(format!("invalid command format: {raw}"));
        }
        match parts[1] {
            "tool" => {
                if parts.len() < 5 {
                    return Err("invalid tool command format".to_string());
                }
                if parts[4] != "launch" {
                    return Err(format!("unknown tool action: {}", parts[4]));
                }
                Ok(Self::ToolLaunch {
                    tool_id: parts[2].to_string(),
                    executable: parts[3].to_string(),
                })
            }
            "system" => Ok(Self::System {
                command_line: parts[2..].join("|"),
            }),
            other => Err(format!("unknown command type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_launch_round_trips() {
        let instruction = Instruction::ToolLaunch {
            tool_id: "t1".to_string(),
            executable: "calc.exe".to_string(),
        };
        let encoded = instruction.encode();
        assert_eq!(encoded, "cmd|tool|t1|calc.exe|launch");
        assert_eq!(Instruction::parse(&encoded).unwrap(), instruction);
    }

    #[test]
    fn system_command_rejoins_embedded_pipes() {
        let parsed = Instruction::parse("cmd|system|echo a | grep a").unwrap();
        assert_eq!(
            parsed,
            Instruction::System {
                command_line: "echo a | grep a".to_string()
            }
        );
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        assert!(Instruction::parse("run|tool|t1|x|launch").is_err());
        assert!(Instruction::parse("").is_err());
        assert!(Instruction::parse("cmd|tool").is_err());
    }

    #[test]
    fn short_tool_command_is_rejected() {
        assert!(Instruction::parse("cmd|tool|t1|calc.exe").is_err());
    }

    #[test]
    fn unknown_type_and_action_are_rejected() {
        assert!(Instruction::parse("cmd|dance|t1").is_err());
        assert!(Instruction::parse("cmd|tool|t1|calc.exe|stop").is_err());
    }
}
