// ABOUTME: schema and status commands: provisioning and endpoint health
// ABOUTME: Status pings both endpoints and reports pool counters

use anyhow::{Context, Result};
use serde_json::json;

use super::print_json;
use crate::routing::Role;
use crate::service::SalesStore;
use crate::store::Connector;

/// Apply the primary DDL, or print the replica DDL for the sink operator.
pub async fn schema<C: Connector>(store: &SalesStore<C>, replica_ddl: bool) -> Result<()> {
    if replica_ddl {
        println!("{}", store.replica_ddl().trim());
        return Ok(());
    }
    store
        .ensure_schema()
        .await
        .context("Failed to create sales tables on primary")?;
    print_json(&json!({ "schema": "applied", "role": Role::Primary }))
}

/// Report reachability, server details and pool counters for both endpoints.
pub async fn status<C: Connector>(store: &SalesStore<C>) -> Result<()> {
    let reachable = store.check_connection().await;

    let mut endpoints = serde_json::Map::new();
    for (role, up) in [(Role::Primary, reachable.primary), (Role::Replica, reachable.replica)] {
        let endpoint = store.config().endpoint(role);
        let details = if up {
            match store.describe(role).await {
                Ok(info) => json!(info),
                Err(e) => {
                    tracing::warn!("Could not describe {} endpoint: {}", role, e);
                    json!({ "error": e.to_string() })
                }
            }
        } else {
            serde_json::Value::Null
        };
        endpoints.insert(
            role.to_string(),
            json!({
                "endpoint": endpoint.label(),
                "reachable": up,
                "details": details,
                "pool": store.pools().stats(role),
            }),
        );
    }
    print_json(&endpoints)
}
