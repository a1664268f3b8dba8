// ABOUTME: Library entry point for replica-router
// ABOUTME: Routes sales operations to a primary or a CDC-fed read replica

pub mod commands;
pub mod config;
pub mod error;
pub mod lag;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod reader;
pub mod routing;
pub mod schema;
pub mod service;
pub mod store;
pub mod utils;
pub mod writer;

pub use config::{EndpointConfig, PoolConfig, ReadConfig, RouterConfig, TlsMode, WriteConfig};
pub use error::RouterError;
pub use lag::{Expectation, LagObserver, PollPolicy, VisibilityReport};
pub use models::{
    AnalyticsSummary, DailySales, DateRange, EndpointInfo, EndpointStatus, NewSalesItem,
    NewTransaction, Page, PageRequest, ProductSales, SalesItem, SalesStats, Transaction,
    TransactionDetail, TransactionFilter, TransactionPatch,
};
pub use pool::{Pool, PoolStats, PooledConnection};
pub use reader::TransactionReader;
pub use routing::{DualPool, Operation, OperationKind, Role};
pub use service::SalesStore;
pub use store::{Connector, StoreConnection, StoreError};
pub use writer::TransactionWriter;
