// ABOUTME: Endpoint introspection for health reporting
// ABOUTME: Server version, read-only state, sales table presence and table privileges

use tokio_postgres::Client;

use crate::models::EndpointInfo;
use crate::routing::Role;
use crate::schema::{ITEM_TABLE, TRANSACTION_TABLE};

/// Result of a table-level permission check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePermissionCheck {
    /// `table:PRIVILEGE` pairs the user holds
    pub granted: Vec<String>,
    /// `table:PRIVILEGE` pairs the user is missing
    pub missing: Vec<String>,
}

impl TablePermissionCheck {
    /// Returns true if nothing required is missing
    pub fn all_granted(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Privileges the access layer needs on each sales table for `role`.
///
/// The primary takes every write; the replica is only ever read.
pub fn required_privileges(role: Role) -> &'static [&'static str] {
    match role {
        Role::Primary => &["SELECT", "INSERT", "UPDATE", "DELETE"],
        Role::Replica => &["SELECT"],
    }
}

/// Check the connected user's privileges on the sales tables
///
/// Tables that do not exist are skipped; [`describe_endpoint`] reports
/// their absence separately.
///
/// # Errors
///
/// Returns an error if the permission query fails.
pub async fn check_table_privileges(
    client: &Client,
    role: Role,
) -> Result<TablePermissionCheck, tokio_postgres::Error> {
    let query = r#"
        SELECT has_table_privilege(current_user, c.oid, $2)
        FROM pg_class c
        WHERE c.oid = to_regclass($1)
    "#;

    let mut check = TablePermissionCheck::default();
    for table in [TRANSACTION_TABLE, ITEM_TABLE] {
        for privilege in required_privileges(role) {
            let row = client.query_opt(query, &[&table, privilege]).await?;
            let Some(row) = row else {
                continue;
            };
            let has: bool = row.try_get(0)?;
            let entry = format!("{}:{}", table, privilege);
            if has {
                check.granted.push(entry);
            } else {
                check.missing.push(entry);
            }
        }
    }
    Ok(check)
}

/// Describe the endpoint this client is connected to
///
/// A replica is expected to report `read_only = true`: either it is a
/// physical standby (`pg_is_in_recovery()`) or the session was opened with
/// `default_transaction_read_only`.
pub async fn describe_endpoint(
    client: &Client,
    role: Role,
) -> Result<EndpointInfo, tokio_postgres::Error> {
    let row = client
        .query_one(
            "SELECT current_setting('server_version'), \
                    current_setting('transaction_read_only') = 'on' OR pg_is_in_recovery(), \
                    to_regclass($1) IS NOT NULL AND to_regclass($2) IS NOT NULL",
            &[&TRANSACTION_TABLE, &ITEM_TABLE],
        )
        .await?;

    let privileges = check_table_privileges(client, role).await?;
    if !privileges.all_granted() {
        tracing::warn!(
            "{} user lacks privileges: {}",
            role,
            privileges.missing.join(", ")
        );
    }

    Ok(EndpointInfo {
        server_version: row.try_get(0)?,
        read_only: row.try_get(1)?,
        tables_present: row.try_get(2)?,
        missing_privileges: privileges.missing,
    })
}
