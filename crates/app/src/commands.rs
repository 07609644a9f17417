/// One line typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCommand {
    Clear,
    History,
    /// Adds one `key: value` custom parameter line.
    Param(String),
    Reload,
    Quit,
    /// Any other non-blank line starts a turn with it.
    Submit(String),
}

impl TerminalCommand {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (name, rest) = trimmed
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((trimmed, ""));
        let command = match name {
            ":clear" if rest.is_empty() => Self::Clear,
            ":history" if rest.is_empty() => Self::History,
            ":reload" if rest.is_empty() => Self::Reload,
            ":quit" | ":q" if rest.is_empty() => Self::Quit,
            ":param" if !rest.is_empty() => Self::Param(rest.to_string()),
            _ => Self::Submit(line.trim_end_matches(['\r', '\n']).to_string()),
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_commands() {
        assert_eq!(TerminalCommand::parse(":clear"), Some(TerminalCommand::Clear));
        assert_eq!(TerminalCommand::parse("  :history "), Some(TerminalCommand::History));
        assert_eq!(TerminalCommand::parse(":reload"), Some(TerminalCommand::Reload));
        assert_eq!(TerminalCommand::parse(":q"), Some(TerminalCommand::Quit));
        assert_eq!(
            TerminalCommand::parse(":param - top_k: 20"),
            Some(TerminalCommand::Param("- top_k: 20".to_string()))
        );
    }

    #[test]
    fn everything_else_is_submitted() {
        assert_eq!(
            TerminalCommand::parse("おはよう、先輩。"),
            Some(TerminalCommand::Submit("おはよう、先輩。".to_string()))
        );
        assert_eq!(
            TerminalCommand::parse(":param"),
            Some(TerminalCommand::Submit(":param".to_string()))
        );
        assert_eq!(TerminalCommand::parse("   "), None);
    }
}
