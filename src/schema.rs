// ABOUTME: DDL for the sales tables on the primary and on the CDC-fed replica
// ABOUTME: The replica copy has no cross-table foreign key because the sink applies tables independently

use crate::routing::Role;

pub const TRANSACTION_TABLE: &str = "sales_transaction";
pub const ITEM_TABLE: &str = "sales_item";

/// Source-of-truth tables. Items cascade with their header.
pub const PRIMARY_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sales_transaction (
    transaction_id   BIGSERIAL PRIMARY KEY,
    transaction_time TIMESTAMP NOT NULL,
    cashier_id       INTEGER NOT NULL,
    store_id         INTEGER NOT NULL,
    payment_method   VARCHAR(50) NOT NULL,
    total_amount     NUMERIC(12, 2) NOT NULL,
    total_discount   NUMERIC(12, 2) NOT NULL DEFAULT 0
        CONSTRAINT sales_transaction_discount_check CHECK (total_discount >= 0),
    customer_id      INTEGER,
    created_at       TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS sales_item (
    item_id        BIGSERIAL PRIMARY KEY,
    transaction_id BIGINT NOT NULL
        REFERENCES sales_transaction (transaction_id) ON DELETE CASCADE,
    product_code   VARCHAR(50) NOT NULL,
    product_name   VARCHAR(200) NOT NULL,
    category       VARCHAR(100),
    quantity       INTEGER NOT NULL
        CONSTRAINT sales_item_quantity_check CHECK (quantity > 0),
    unit_price     NUMERIC(10, 2) NOT NULL
        CONSTRAINT sales_item_unit_price_check CHECK (unit_price >= 0),
    discount       NUMERIC(10, 2) NOT NULL DEFAULT 0
        CONSTRAINT sales_item_discount_check CHECK (discount >= 0),
    total_price    NUMERIC(12, 2) NOT NULL
);

CREATE INDEX IF NOT EXISTS sales_item_transaction_id_idx ON sales_item (transaction_id);
CREATE INDEX IF NOT EXISTS sales_transaction_time_idx ON sales_transaction (transaction_time);
"#;

/// Sink-side tables, for the pipeline operator. Same columns, plain keys:
/// ids are copied from the primary and items may land before their header.
pub const REPLICA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sales_transaction (
    transaction_id   BIGINT PRIMARY KEY,
    transaction_time TIMESTAMP NOT NULL,
    cashier_id       INTEGER NOT NULL,
    store_id         INTEGER NOT NULL,
    payment_method   VARCHAR(50) NOT NULL,
    total_amount     NUMERIC(12, 2) NOT NULL,
    total_discount   NUMERIC(12, 2) NOT NULL DEFAULT 0,
    customer_id      INTEGER,
    created_at       TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS sales_item (
    item_id        BIGINT PRIMARY KEY,
    transaction_id BIGINT NOT NULL,
    product_code   VARCHAR(50) NOT NULL,
    product_name   VARCHAR(200) NOT NULL,
    category       VARCHAR(100),
    quantity       INTEGER NOT NULL,
    unit_price     NUMERIC(10, 2) NOT NULL,
    discount       NUMERIC(10, 2) NOT NULL DEFAULT 0,
    total_price    NUMERIC(12, 2) NOT NULL
);

CREATE INDEX IF NOT EXISTS sales_item_transaction_id_idx ON sales_item (transaction_id);
CREATE INDEX IF NOT EXISTS sales_transaction_time_idx ON sales_transaction (transaction_time);
"#;

pub fn ddl_for(role: Role) -> &'static str {
    match role {
        Role::Primary => PRIMARY_DDL,
        Role::Replica => REPLICA_DDL,
    }
}
