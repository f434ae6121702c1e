//! Protocol command namespace.
//!
//! Protocol commands are bracketed (`<PING>`, `<OK:PONG>` ...) and handled by
//! the dispatcher itself. Anything else is an application command and is
//! validated before it may be queued or sent as a reply.

use std::fmt;

use thiserror::Error;

/// Maximum application command length
pub const MAX_COMMAND_LEN: usize = 255;

/// Error marker prefix carried by error reports
pub const ERROR_MARKER: &str = "<ERR:";

/// Reserved bracketed commands
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolCommand {
    /// Server keep-alive
    Ping,
    /// Client keep-alive
    Pong,
    /// Acknowledgement of a ping
    OkPing,
    /// Acknowledgement of a pong
    OkPong,
    /// Generic acknowledgement
    Ok,
    /// Status notice
    Info,
    /// Reserved error command
    Err,
    /// Error report, the full `<ERR:...>` string
    ErrorReport(String),
    /// Handshake offer
    KxOffer,
    /// Handshake reply
    KxReply,
}

impl ProtocolCommand {
    /// Recognize a reserved command, `None` for application commands
    pub fn parse(cmd: &str) -> Option<Self> {
        let cmd = match cmd {
            "<PING>" => Self::Ping,
            "<PONG>" => Self::Pong,
            "<OK:PING>" => Self::OkPing,
            "<OK:PONG>" => Self::OkPong,
            "<OK>" => Self::Ok,
            "<INFO>" => Self::Info,
            "<ERR>" => Self::Err,
            "<KX:OFFER>" => Self::KxOffer,
            "<KX:REPLY>" => Self::KxReply,
            other if other.starts_with(ERROR_MARKER) => Self::ErrorReport(other.to_string()),
            _ => return None,
        };
        Some(cmd)
    }

    /// Wire string
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "<PING>",
            Self::Pong => "<PONG>",
            Self::OkPing => "<OK:PING>",
            Self::OkPong => "<OK:PONG>",
            Self::Ok => "<OK>",
            Self::Info => "<INFO>",
            Self::Err => "<ERR>",
            Self::ErrorReport(s) => s,
            Self::KxOffer => "<KX:OFFER>",
            Self::KxReply => "<KX:REPLY>",
        }
    }

    /// Whether the command belongs to the handshake phase
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::KxOffer | Self::KxReply)
    }
}

impl fmt::Display for ProtocolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application command validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Empty after trimming
    #[error("command is empty")]
    Empty,

    /// Longer than [`MAX_COMMAND_LEN`]
    #[error("command is too long: {0} chars")]
    TooLong(usize),

    /// Character outside `[A-Za-z0-9.:-]`
    #[error("command contains invalid character {0:?}")]
    InvalidChar(char),

    /// `:` in a scheduled task command
    #[error("scheduled task commands cannot contain ':'")]
    ColonNotAllowed,

    /// Collides with a reserved command
    #[error("command {0} is reserved")]
    Reserved(String),

    /// Not in the configured allow-list
    #[error("command {0} is not allowed")]
    NotAllowed(String),
}

const RESERVED_WORDS: &[&str] = &["PING", "PONG", "OK", "INFO", "ERR"];

/// Validate an application command as sent in a handler reply
pub fn validate_app_command(cmd: &str) -> Result<&str, CommandError> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err(CommandError::Empty);
    }
    if cmd.len() > MAX_COMMAND_LEN {
        return Err(CommandError::TooLong(cmd.len()));
    }
    if let Some(c) = cmd
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-')))
    {
        return Err(CommandError::InvalidChar(c));
    }

    let upper = cmd.to_ascii_uppercase();
    if RESERVED_WORDS.contains(&upper.as_str()) || upper.starts_with("ERR") {
        return Err(CommandError::Reserved(cmd.to_string()));
    }
    Ok(cmd)
}

/// Validate a command submitted as a scheduled task.
///
/// An empty allow-list accepts any well-formed command.
pub fn validate_task_command<'a>(
    cmd: &'a str,
    allowed: &[String],
) -> Result<&'a str, CommandError> {
    let cmd = validate_app_command(cmd)?;
    if cmd.contains(':') {
        return Err(CommandError::ColonNotAllowed);
    }
    if !allowed.is_empty() && !allowed.iter().any(|a| a == cmd) {
        return Err(CommandError::NotAllowed(cmd.to_string()));
    }
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reserved() {
        for cmd in [
            ProtocolCommand::Ping,
            ProtocolCommand::Pong,
            ProtocolCommand::OkPing,
            ProtocolCommand::OkPong,
            ProtocolCommand::Ok,
            ProtocolCommand::Info,
            ProtocolCommand::Err,
            ProtocolCommand::KxOffer,
            ProtocolCommand::KxReply,
        ] {
            assert_eq!(ProtocolCommand::parse(cmd.as_str()), Some(cmd));
        }
        assert_eq!(
            ProtocolCommand::parse("<ERR:UNHANDLED>"),
            Some(ProtocolCommand::ErrorReport("<ERR:UNHANDLED>".into()))
        );
        assert_eq!(ProtocolCommand::parse("REPORT"), None);
        assert_eq!(ProtocolCommand::parse("PING"), None);
    }

    #[test]
    fn test_app_command_charset_and_length() {
        assert_eq!(validate_app_command(" sync.files-v2 "), Ok("sync.files-v2"));
        assert_eq!(validate_app_command("OK:received"), Ok("OK:received"));
        assert_eq!(validate_app_command(""), Err(CommandError::Empty));
        assert_eq!(validate_app_command("a b"), Err(CommandError::InvalidChar(' ')));
        assert_eq!(validate_app_command("<X>"), Err(CommandError::InvalidChar('<')));
        let long = "a".repeat(256);
        assert_eq!(validate_app_command(&long), Err(CommandError::TooLong(256)));
        assert!(validate_app_command(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_reserved_words_rejected() {
        for cmd in ["ping", "PONG", "Ok", "info", "ERR", "errors", "ERR-X"] {
            assert!(
                matches!(validate_app_command(cmd), Err(CommandError::Reserved(_))),
                "{} should be reserved",
                cmd
            );
        }
        assert!(validate_app_command("OKAY").is_ok());
    }

    #[test]
    fn test_task_command_rules() {
        assert_eq!(
            validate_task_command("DO:THIS", &[]),
            Err(CommandError::ColonNotAllowed)
        );
        assert_eq!(validate_task_command("REPORT", &[]), Ok("REPORT"));

        let allowed = vec!["REPORT".to_string()];
        assert_eq!(validate_task_command("REPORT", &allowed), Ok("REPORT"));
        assert_eq!(
            validate_task_command("RESTART", &allowed),
            Err(CommandError::NotAllowed("RESTART".into()))
        );
    }
}
