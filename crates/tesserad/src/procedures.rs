//! Procedures and events this node serves to its peers.

use std::sync::{Arc, OnceLock};

use serde_json::{json, Value};

use tessera_core::SystemHeaders;
use tessera_peers::{Endpoints, PoolHandle};

/// Build the endpoint table. `pool` is filled in once the pool service
/// exists; until then `list` reports that it is unavailable.
pub fn endpoints(headers: SystemHeaders, pool: Arc<OnceLock<PoolHandle>>) -> Endpoints {
    let mut endpoints = Endpoints::new();

    endpoints.register_rpc("status", move |_| {
        let status = serde_json::to_value(&headers).map_err(|e| e.to_string());
        async move { status }
    });

    endpoints.register_rpc("list", move |_| {
        let pool = pool.get().cloned();
        async move {
            let pool = pool.ok_or_else(|| "peer pool not ready".to_string())?;
            let peers = pool.peers().await.map_err(|e| e.to_string())?;
            let peers = serde_json::to_value(peers).map_err(|e| e.to_string())?;
            Ok::<Value, String>(json!({ "peers": peers }))
        }
    });

    endpoints.register_event("postBlock", |data: Value| {
        let height = data.get("height").and_then(Value::as_u64);
        let id = data.get("id").and_then(Value::as_str).unwrap_or("?");
        tracing::info!(id, height, "block announced by peer");
    });

    endpoints
}
