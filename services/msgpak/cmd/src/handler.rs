//! Default application handler for the binary: log each command and
//! acknowledge it.

use async_trait::async_trait;
use msgpak_session::{CommandContext, CommandHandler, HandlerReply};

use crate::component_info;

/// Logs application commands and acknowledges each with `OK`
#[derive(Debug, Default, Clone, Copy)]
pub struct AckHandler;

#[async_trait]
impl CommandHandler for AckHandler {
    async fn handle(&self, ctx: &CommandContext, cmd: &str, data: &str) -> HandlerReply {
        component_info!(
            "handler",
            "{} received {} ({} bytes) from {}",
            ctx.local_id,
            cmd,
            data.len(),
            ctx.remote_id
        );
        HandlerReply::reply("OK", "received")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acknowledges_every_command() {
        let ctx = CommandContext {
            is_server: false,
            local_id: "client-1".into(),
            remote_id: "10.0.0.1:7000".into(),
            auth_user: "operator".into(),
            auth_pass: "s3cret-pass".into(),
        };
        assert_eq!(
            AckHandler.handle(&ctx, "REPORT", "hello").await,
            HandlerReply::reply("OK", "received")
        );
    }
}
