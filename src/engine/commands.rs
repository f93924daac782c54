//! Slash commands: the closed grammar recognised in issue and PR comments.
//!
//! Only `/plan` and `/code` are commands. Anything after the command on the
//! same line is kept as a free-text note for the agent. Unknown `/something`
//! lines are ignored without telling the user.

/// Parsed command from a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// (Re-)run the planner.
    Plan(Option<String>),
    /// Run the coder against the current plan.
    Code(Option<String>),
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan(Some(n)) => write!(f, "/plan {n}"),
            Self::Plan(None) => write!(f, "/plan"),
            Self::Code(Some(n)) => write!(f, "/code {n}"),
            Self::Code(None) => write!(f, "/code"),
        }
    }
}

/// Parse a command from a comment body.
///
/// Scans each line for a `/command` at the start. Returns the first valid
/// command found.
pub fn parse_command(body: &str) -> Option<Command> {
    for line in body.lines() {
        let line = line.trim();
        if !line.starts_with('/') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let cmd = parts.next().unwrap_or_default().to_ascii_lowercase();
        let note = parts
            .next()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from);

        match cmd.as_str() {
            "/plan" => return Some(Command::Plan(note)),
            "/code" => return Some(Command::Code(note)),
            _ => continue,
        }
    }
    None
}
