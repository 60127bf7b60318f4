//! The foreign JSON-RPC API.
//!
//! A small axum server with a method-name → handler map registered at boot.
//! Handlers are stateless closures over the service handles. Error codes:
//! -32600 malformed request, -32601 unknown method, -32602 invalid params,
//! -1 consensus rejection, -2 not found. Consensus details never leak past
//! a category string.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::chain::{Chain, ChainError};
use crate::core::hash::{Hash, Hashed};
use crate::core::transaction::Transaction;
use crate::pool::{PoolError, TransactionPool};
use crate::ser;

/// JSON-RPC error codes.
pub const ERR_MALFORMED: i64 = -32600;
pub const ERR_UNKNOWN_METHOD: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_CONSENSUS: i64 = -1;
pub const ERR_NOT_FOUND: i64 = -2;

/// A handler failure carried back in the response envelope.
#[derive(Clone, Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn invalid_params(msg: &str) -> Self {
        RpcError {
            code: ERR_INVALID_PARAMS,
            message: msg.into(),
        }
    }

    fn not_found() -> Self {
        RpcError {
            code: ERR_NOT_FOUND,
            message: "not found".into(),
        }
    }

    fn consensus(category: &str) -> Self {
        RpcError {
            code: ERR_CONSENSUS,
            message: category.into(),
        }
    }
}

type Handler = Arc<dyn Fn(&RpcContext, &Value) -> Result<Value, RpcError> + Send + Sync>;

/// Service handles the RPC layer dispatches over.
pub struct RpcContext {
    pub chain: Arc<Chain>,
    pub pool: Arc<TransactionPool>,
}

/// The method registry plus its context.
pub struct RpcServer {
    ctx: Arc<RpcContext>,
    handlers: HashMap<&'static str, Handler>,
}

fn param_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn param_hash(params: &Value, key: &str) -> Result<Option<Hash>, RpcError> {
    match params.get(key).and_then(Value::as_str) {
        Some(s) => Hash::from_hex(s)
            .map(Some)
            .ok_or_else(|| RpcError::invalid_params("bad hash hex")),
        None => Ok(None),
    }
}

fn header_lookup(ctx: &RpcContext, params: &Value) -> Result<crate::core::block::BlockHeader, RpcError> {
    if let Some(height) = param_u64(params, "height") {
        return ctx
            .chain
            .get_header_by_height(height)
            .map_err(|_| RpcError::not_found())?
            .ok_or_else(RpcError::not_found);
    }
    if let Some(hash) = param_hash(params, "hash")? {
        return ctx
            .chain
            .get_header(&hash)
            .map_err(|_| RpcError::not_found())?
            .ok_or_else(RpcError::not_found);
    }
    Err(RpcError::invalid_params("expected height or hash"))
}

impl RpcServer {
    pub fn new(chain: Arc<Chain>, pool: Arc<TransactionPool>) -> Self {
        let mut server = RpcServer {
            ctx: Arc::new(RpcContext { chain, pool }),
            handlers: HashMap::new(),
        };
        server.register("get_version", |_ctx, _params| {
            Ok(json!({
                "node_version": crate::NODE_VERSION,
                "block_header_version": 1,
            }))
        });
        server.register("get_tip", |ctx, _params| {
            let tip = ctx.chain.head().map_err(|_| RpcError::not_found())?;
            Ok(json!({
                "height": tip.height,
                "last_block_pushed": tip.hash.to_hex(),
                "prev_block_to_last": tip.prev_hash.to_hex(),
                "total_difficulty": tip.total_difficulty,
            }))
        });
        server.register("get_header", |ctx, params| {
            let header = header_lookup(ctx, params)?;
            Ok(json!({
                "hash": header.hash().to_hex(),
                "header": header,
            }))
        });
        server.register("get_block", |ctx, params| {
            let header = header_lookup(ctx, params)?;
            let block = ctx
                .chain
                .get_block(&header.hash())
                .map_err(|_| RpcError::not_found())?
                .ok_or_else(RpcError::not_found)?;
            Ok(json!({
                "hash": block.hash().to_hex(),
                "header": block.header,
                "inputs": block.body.inputs,
                "outputs": block.body.outputs,
                "kernels": block.body.kernels,
            }))
        });
        server.register("push_transaction", |ctx, params| {
            let tx_hex = params
                .get("tx_hex")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("expected tx_hex"))?;
            let bytes =
                hex::decode(tx_hex).map_err(|_| RpcError::invalid_params("bad tx hex"))?;
            let tx: Transaction =
                ser::deser(&bytes).map_err(|_| RpcError::invalid_params("undecodable tx"))?;
            let hash = tx.hash();
            ctx.pool.add_to_mempool(tx).map_err(|e| match e {
                PoolError::Duplicate => RpcError::consensus("already known"),
                PoolError::InputNotFound(_) => RpcError::consensus("input not found"),
                PoolError::FeeTooLow { .. } => RpcError::consensus("fee too low"),
                _ => RpcError::consensus("rejected"),
            })?;
            Ok(json!({ "pushed": hash.to_hex() }))
        });
        server
    }

    fn register<F>(&mut self, method: &'static str, handler: F)
    where
        F: Fn(&RpcContext, &Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.handlers.insert(method, Arc::new(handler));
    }

    /// Dispatch one JSON-RPC request value to its handler.
    pub fn handle(&self, request: &Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return error_envelope(id, ERR_MALFORMED, "missing method");
        };
        if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return error_envelope(id, ERR_MALFORMED, "expected jsonrpc 2.0");
        }
        let params = request.get("params").cloned().unwrap_or(json!({}));

        let Some(handler) = self.handlers.get(method) else {
            return error_envelope(id, ERR_UNKNOWN_METHOD, "unknown method");
        };
        debug!(method, "rpc call");
        match handler(&self.ctx, &params) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(e) => error_envelope(id, e.code, &e.message),
        }
    }

    /// Serve over HTTP until cancelled.
    pub async fn serve(
        self: Arc<Self>,
        addr: std::net::SocketAddr,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> std::io::Result<()> {
        let app = Router::new()
            .route("/", post(http_handle))
            .route("/v2/foreign", post(http_handle))
            .with_state(self);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "rpc listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

async fn http_handle(
    State(server): State<Arc<RpcServer>>,
    Json(request): Json<Value>,
) -> Json<Value> {
    Json(server.handle(&request))
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}
