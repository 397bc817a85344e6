//! Stdio transport: line-delimited JSON-RPC on stdin/stdout.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::rpc::jsonrpc;
use crate::tools::{ToolContext, ToolRegistry};

/// Serve JSON-RPC over stdin/stdout until EOF.
pub async fn run_stdio(registry: Arc<ToolRegistry>, ctx: Arc<ToolContext>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match jsonrpc::parse_request(trimmed) {
            Ok(request) => {
                debug!(method = %request.method, "stdio request");
                jsonrpc::handle_request(&registry, &ctx, request).await
            }
            Err(error) => error,
        };

        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        stdout.write_all(&body).await?;
        stdout.flush().await?;
    }

    Ok(())
}
