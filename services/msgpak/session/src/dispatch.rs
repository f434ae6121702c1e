//! Command dispatch.
//!
//! Protocol commands are answered (or ignored) here; application commands
//! go to the injected [`CommandHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use msgpak_wire::{validate_app_command, ProtocolCommand, ERROR_MARKER};
use tracing::{debug, error, info, warn};

/// Call context handed to the application handler
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// Whether the local side is the server
    pub is_server: bool,
    /// Local identifier
    pub local_id: String,
    /// Remote peer identifier (socket address or pool address)
    pub remote_id: String,
    /// Transport user
    pub auth_user: String,
    /// Transport password
    pub auth_pass: String,
}

/// Application handler outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerReply {
    /// Nothing to send back
    None,
    /// Send a reply
    Reply {
        /// Reply command
        cmd: String,
        /// Reply payload
        data: String,
    },
    /// Report a failure to the peer as an `<INFO>` notice
    Error(String),
}

impl HandlerReply {
    /// Shorthand for a reply
    pub fn reply(cmd: impl Into<String>, data: impl Into<String>) -> Self {
        HandlerReply::Reply {
            cmd: cmd.into(),
            data: data.into(),
        }
    }
}

/// Application command handler
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one application command
    async fn handle(&self, ctx: &CommandContext, cmd: &str, data: &str) -> HandlerReply;
}

/// Handler that refuses every application command
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectUnhandled;

#[async_trait]
impl CommandHandler for RejectUnhandled {
    async fn handle(&self, _ctx: &CommandContext, cmd: &str, _data: &str) -> HandlerReply {
        HandlerReply::Error(format!("{}UNHANDLED> {}", ERROR_MARKER, cmd))
    }
}

/// Outbound message produced by the dispatcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Command
    pub cmd: String,
    /// Payload
    pub data: String,
}

impl Outbound {
    fn protocol(cmd: ProtocolCommand, data: String) -> Self {
        Self {
            cmd: cmd.as_str().to_string(),
            data,
        }
    }

    fn error_notice(message: &str) -> Self {
        let data = if message.starts_with(ERROR_MARKER) {
            message.to_string()
        } else {
            format!("{}HANDLER> {}", ERROR_MARKER, message)
        };
        Self::protocol(ProtocolCommand::Info, data)
    }
}

/// Routes inbound commands
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn CommandHandler>,
}

impl Dispatcher {
    /// Create a dispatcher around an application handler
    pub fn new(handler: Arc<dyn CommandHandler>) -> Self {
        Self { handler }
    }

    /// Dispatch one verified envelope, returning the reply to send if any
    pub async fn dispatch(&self, ctx: &CommandContext, cmd: &str, data: &str) -> Option<Outbound> {
        let (area, remote_area) = if ctx.is_server {
            ("server", "client")
        } else {
            ("client", "server")
        };
        debug!(
            "Received {} on {} from {} {} ({} bytes)",
            cmd,
            area,
            remote_area,
            ctx.remote_id,
            data.len()
        );

        let ack_data = || {
            format!(
                "{} {}: {} (length={})",
                area,
                ctx.local_id,
                cmd,
                data.len()
            )
        };

        match ProtocolCommand::parse(cmd) {
            Some(ProtocolCommand::Ping) => {
                if ctx.is_server {
                    warn!("Ignoring {} from client {}", cmd, ctx.remote_id);
                    None
                } else {
                    Some(Outbound::protocol(ProtocolCommand::OkPing, ack_data()))
                }
            }
            Some(ProtocolCommand::Pong) => {
                if ctx.is_server {
                    Some(Outbound::protocol(ProtocolCommand::OkPong, ack_data()))
                } else {
                    warn!("Ignoring {} from server {}", cmd, ctx.remote_id);
                    None
                }
            }
            Some(ProtocolCommand::OkPing | ProtocolCommand::OkPong | ProtocolCommand::Ok) => {
                info!("{} confirmation from {}: {}", cmd, ctx.remote_id, data);
                None
            }
            Some(ProtocolCommand::Info) => {
                if data.starts_with(ERROR_MARKER) {
                    error!("Error notice from {}: {}", ctx.remote_id, data);
                } else {
                    info!("Status notice from {}: {}", ctx.remote_id, data);
                }
                None
            }
            Some(ProtocolCommand::Err) => {
                error!("{} is reserved, dropped message from {}", cmd, ctx.remote_id);
                None
            }
            Some(ProtocolCommand::ErrorReport(report)) => {
                error!("Error report from {}: {} {}", ctx.remote_id, report, data);
                None
            }
            Some(kx @ (ProtocolCommand::KxOffer | ProtocolCommand::KxReply)) => {
                warn!(
                    "Ignoring {} from {} after the key exchange",
                    kx, ctx.remote_id
                );
                None
            }
            None => {
                let reply = self.handler.handle(ctx, cmd, data).await;
                self.fold_reply(ctx, cmd, reply)
            }
        }
    }

    fn fold_reply(&self, ctx: &CommandContext, cmd: &str, reply: HandlerReply) -> Option<Outbound> {
        match reply {
            HandlerReply::None => None,
            HandlerReply::Error(message) => {
                error!("Handler failed on {} from {}: {}", cmd, ctx.remote_id, message);
                Some(Outbound::error_notice(&message))
            }
            HandlerReply::Reply { cmd: reply_cmd, data } => {
                let trimmed = reply_cmd.trim();
                if trimmed.is_empty() && data.is_empty() {
                    return None;
                }

                // Terminal notices are the only protocol commands a handler may send.
                if trimmed.eq_ignore_ascii_case("OK") || trimmed == ProtocolCommand::Ok.as_str() {
                    return Some(Outbound::protocol(ProtocolCommand::Ok, data));
                }
                if trimmed.eq_ignore_ascii_case("INFO") || trimmed == ProtocolCommand::Info.as_str()
                {
                    return Some(Outbound::protocol(ProtocolCommand::Info, data));
                }
                if trimmed.starts_with(ERROR_MARKER) {
                    error!("Handler reported {} on {} from {}", trimmed, cmd, ctx.remote_id);
                    return Some(Outbound::error_notice(trimmed));
                }

                match validate_app_command(trimmed) {
                    Ok(valid) => Some(Outbound {
                        cmd: valid.to_string(),
                        data,
                    }),
                    Err(e) => {
                        error!(
                            "Handler reply {:?} to {} is invalid: {}",
                            reply_cmd, cmd, e
                        );
                        Some(Outbound::error_notice(&format!(
                            "invalid reply command: {}",
                            e
                        )))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, ctx: &CommandContext, cmd: &str, data: &str) -> HandlerReply {
            match cmd {
                "REPORT" => HandlerReply::reply("OK", format!("received {}", data)),
                "SILENT" => HandlerReply::None,
                "FAIL" => HandlerReply::Error("disk full".into()),
                "BAD" => HandlerReply::reply("PING", ""),
                "MARKED" => HandlerReply::reply("<ERR:BUSY>", ""),
                _ => HandlerReply::reply("ECHO", format!("{}:{}", ctx.remote_id, data)),
            }
        }
    }

    fn ctx(is_server: bool) -> CommandContext {
        CommandContext {
            is_server,
            local_id: "local".into(),
            remote_id: "remote".into(),
            auth_user: "operator".into(),
            auth_pass: "s3cret-pass".into(),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(Echo))
    }

    #[tokio::test]
    async fn test_keepalive_directionality() {
        let d = dispatcher();

        let reply = d.dispatch(&ctx(false), "<PING>", "").await.unwrap();
        assert_eq!(reply.cmd, "<OK:PING>");
        assert_eq!(d.dispatch(&ctx(true), "<PING>", "").await, None);

        let reply = d.dispatch(&ctx(true), "<PONG>", "").await.unwrap();
        assert_eq!(reply.cmd, "<OK:PONG>");
        assert_eq!(d.dispatch(&ctx(false), "<PONG>", "").await, None);
    }

    #[tokio::test]
    async fn test_terminal_commands_not_answered() {
        let d = dispatcher();
        for cmd in [
            "<OK:PING>",
            "<OK:PONG>",
            "<OK>",
            "<INFO>",
            "<ERR>",
            "<ERR:BROKEN>",
            "<KX:OFFER>",
            "<KX:REPLY>",
        ] {
            assert_eq!(d.dispatch(&ctx(true), cmd, "x").await, None, "{}", cmd);
            assert_eq!(d.dispatch(&ctx(false), cmd, "x").await, None, "{}", cmd);
        }
        assert_eq!(
            d.dispatch(&ctx(true), "<INFO>", "<ERR:HANDLER> boom").await,
            None
        );
    }

    #[tokio::test]
    async fn test_application_reply() {
        let d = dispatcher();
        let reply = d.dispatch(&ctx(false), "REPORT", "hello").await.unwrap();
        assert_eq!(
            reply,
            Outbound {
                cmd: "<OK>".into(),
                data: "received hello".into()
            }
        );

        let reply = d.dispatch(&ctx(false), "STATUS", "v").await.unwrap();
        assert_eq!(reply.cmd, "ECHO");
        assert_eq!(reply.data, "remote:v");

        assert_eq!(d.dispatch(&ctx(false), "SILENT", "").await, None);
    }

    #[tokio::test]
    async fn test_errors_folded_into_info() {
        let d = dispatcher();

        let reply = d.dispatch(&ctx(true), "FAIL", "").await.unwrap();
        assert_eq!(reply.cmd, "<INFO>");
        assert_eq!(reply.data, "<ERR:HANDLER> disk full");

        let reply = d.dispatch(&ctx(true), "BAD", "").await.unwrap();
        assert_eq!(reply.cmd, "<INFO>");
        assert!(reply.data.starts_with(ERROR_MARKER));

        let reply = d.dispatch(&ctx(true), "MARKED", "").await.unwrap();
        assert_eq!(reply.cmd, "<INFO>");
        assert_eq!(reply.data, "<ERR:BUSY>");
    }

    #[tokio::test]
    async fn test_reject_unhandled() {
        let d = Dispatcher::new(Arc::new(RejectUnhandled));
        let reply = d.dispatch(&ctx(false), "REPORT", "").await.unwrap();
        assert_eq!(reply.cmd, "<INFO>");
        assert_eq!(reply.data, "<ERR:UNHANDLED> REPORT");
    }
}
