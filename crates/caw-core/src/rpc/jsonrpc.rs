//! JSON-RPC 2.0 request handling shared by both transports.
//!
//! Tools are dispatched by method name; `initialize`, `tools/list`, and
//! `tools/call` are also accepted for MCP-style peers. Tool errors never
//! become RPC errors: they serialise into the result body with an
//! `isError` flag, so the only RPC-level errors are parse/request/method
//! failures.

use std::sync::Arc;

use serde::Deserialize;

use crate::tools::{ToolContext, ToolRegistry};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Transport-level "no active session".
pub const BAD_SESSION: i64 = -32000;

/// An incoming JSON-RPC 2.0 request.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// A success response.
pub fn result_response(id: Option<serde_json::Value>, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// An error response.
pub fn error_response(
    id: Option<serde_json::Value>,
    code: i64,
    message: impl Into<String>,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

/// Handle one parsed request against the tool registry.
pub async fn handle_request(
    registry: &ToolRegistry,
    ctx: &Arc<ToolContext>,
    request: Request,
) -> serde_json::Value {
    if request.jsonrpc.as_deref() != Some("2.0") {
        return error_response(request.id, INVALID_REQUEST, "expected jsonrpc 2.0");
    }

    let id = request.id.clone();

    match request.method.as_str() {
        "initialize" => result_response(
            id,
            serde_json::json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": { "name": "caw", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": { "tools": {} },
            }),
        ),
        "tools/list" => {
            let tools: Vec<serde_json::Value> = registry
                .list()
                .iter()
                .map(|def| {
                    serde_json::json!({
                        "name": def.name,
                        "description": def.description,
                    })
                })
                .collect();
            result_response(id, serde_json::json!({ "tools": tools }))
        }
        "tools/call" => {
            #[derive(Deserialize)]
            struct CallParams {
                name: String,
                #[serde(default)]
                arguments: serde_json::Value,
            }
            let params: CallParams = match request
                .params
                .map(serde_json::from_value)
                .transpose()
            {
                Ok(Some(params)) => params,
                Ok(None) => {
                    return error_response(id, INVALID_REQUEST, "tools/call requires params");
                }
                Err(e) => {
                    return error_response(id, INVALID_REQUEST, format!("bad params: {e}"));
                }
            };
            dispatch_tool(registry, ctx, id, &params.name, params.arguments).await
        }
        // Any other method name is treated as a tool name.
        tool_name => {
            let args = request.params.unwrap_or_else(|| serde_json::json!({}));
            dispatch_tool(registry, ctx, id, tool_name, args).await
        }
    }
}

async fn dispatch_tool(
    registry: &ToolRegistry,
    ctx: &Arc<ToolContext>,
    id: Option<serde_json::Value>,
    name: &str,
    args: serde_json::Value,
) -> serde_json::Value {
    match registry.dispatch(ctx, name, args).await {
        None => error_response(id, METHOD_NOT_FOUND, format!("Method not found: {name}")),
        Some(Ok(value)) => result_response(id, value),
        Some(Err(error)) => {
            let mut body = error;
            body["isError"] = serde_json::json!(true);
            result_response(id, body)
        }
    }
}

/// Parse one raw line/body into a request, producing the right error
/// response when it is not valid.
pub fn parse_request(raw: &str) -> Result<Request, serde_json::Value> {
    match serde_json::from_str::<Request>(raw) {
        Ok(request) => Ok(request),
        Err(e) => {
            // Distinguish unparseable JSON from JSON that is not a request.
            if serde_json::from_str::<serde_json::Value>(raw).is_ok() {
                Err(error_response(None, INVALID_REQUEST, format!("invalid request: {e}")))
            } else {
                Err(error_response(None, PARSE_ERROR, format!("parse error: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_request() {
        let request =
            parse_request(r#"{"jsonrpc":"2.0","id":1,"method":"workflow_list","params":{}}"#)
                .unwrap();
        assert_eq!(request.method, "workflow_list");
        assert_eq!(request.id, Some(serde_json::json!(1)));
    }

    #[test]
    fn parse_garbage_is_parse_error() {
        let response = parse_request("not json at all").unwrap_err();
        assert_eq!(response["error"]["code"], PARSE_ERROR);
    }

    #[test]
    fn parse_json_without_method_is_invalid_request() {
        let response = parse_request(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(response["error"]["code"], INVALID_REQUEST);
    }

    #[test]
    fn error_response_shape() {
        let response = error_response(Some(serde_json::json!(7)), BAD_SESSION, "Bad Request: No active session");
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 7);
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["error"]["message"], "Bad Request: No active session");
    }
}
