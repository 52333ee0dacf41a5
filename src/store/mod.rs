//! Persistence seam: rows as JSON maps behind an async trait.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{FieldType, ModelDescriptor, RelationDescriptor};

pub use memory::MemStore;
pub use postgres::{ensure_database_exists, PgStore};

/// One persisted record, keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Database(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
}

/// One hop along a relation while filtering on a dotted path. The
/// target table is resolved up front so stores need no model graph.
#[derive(Clone, Debug)]
pub struct RelationStep {
    pub relation: RelationDescriptor,
    pub target_table: String,
}

/// A leaf comparison, possibly at the end of a relation path. A `Null`
/// value means an IS NULL test (IS NOT NULL under `Ne`).
#[derive(Clone, Debug)]
pub struct ResolvedCond {
    pub steps: Vec<RelationStep>,
    pub field: String,
    pub field_type: FieldType,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Clone, Debug)]
pub enum FilterNode {
    Cond(ResolvedCond),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
}

impl FilterNode {
    /// Direct equality on a local column, for query scopes and
    /// uniqueness probes.
    pub fn eq(field: impl Into<String>, field_type: FieldType, value: Value) -> Self {
        FilterNode::Cond(ResolvedCond {
            steps: Vec::new(),
            field: field.into(),
            field_type,
            op: FilterOp::Eq,
            value,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct StoreQuery {
    /// Nodes are ANDed together.
    pub filter: Vec<FilterNode>,
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl StoreQuery {
    pub fn filtered(mut self, node: FilterNode) -> Self {
        self.filter.push(node);
        self
    }
}

/// Backend contract for the generated handlers. Implementations return
/// whole rows; shaping happens above this seam.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn select(
        &self,
        model: &ModelDescriptor,
        query: &StoreQuery,
    ) -> Result<Vec<Row>, StoreError>;

    /// Count of distinct primary keys matching the filter.
    async fn count(
        &self,
        model: &ModelDescriptor,
        filter: &[FilterNode],
    ) -> Result<u64, StoreError>;

    async fn find_by_field(
        &self,
        model: &ModelDescriptor,
        field: &str,
        value: &Value,
    ) -> Result<Option<Row>, StoreError>;

    async fn find_where_in(
        &self,
        model: &ModelDescriptor,
        field: &str,
        values: &[Value],
    ) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, model: &ModelDescriptor, row: Row) -> Result<Row, StoreError>;

    async fn update(
        &self,
        model: &ModelDescriptor,
        pk: &Value,
        changes: Row,
    ) -> Result<Option<Row>, StoreError>;

    async fn delete(&self, model: &ModelDescriptor, pk: &Value)
        -> Result<Option<Row>, StoreError>;
}
