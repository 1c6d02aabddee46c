use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Row = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("Invalid column name: {0:?}")]
    InvalidColumn(String),

    #[error("Invalid filter {0:?} - expected column=op.value")]
    InvalidFilter(String),

    #[error("Unknown filter operator: {0}")]
    UnknownOperator(String),
}

/// PostgREST comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    Is,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Like => "like",
            FilterOp::ILike => "ilike",
            FilterOp::Is => "is",
        }
    }
}

impl FromStr for FilterOp {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(FilterOp::Eq),
            "neq" => Ok(FilterOp::Neq),
            "gt" => Ok(FilterOp::Gt),
            "gte" => Ok(FilterOp::Gte),
            "lt" => Ok(FilterOp::Lt),
            "lte" => Ok(FilterOp::Lte),
            "like" => Ok(FilterOp::Like),
            "ilike" => Ok(FilterOp::ILike),
            "is" => Ok(FilterOp::Is),
            other => Err(QueryError::UnknownOperator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl FromStr for Filter {
    type Err = QueryError;

    /// Parse `column=op.value`, e.g. `status=eq.open`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| QueryError::InvalidFilter(s.to_string()))?;
        let (op, value) = rest
            .split_once('.')
            .ok_or_else(|| QueryError::InvalidFilter(s.to_string()))?;

        let column = column.trim();
        if !is_valid_identifier(column) {
            return Err(QueryError::InvalidColumn(column.to_string()));
        }

        Ok(Filter {
            column: column.to_string(),
            op: op.parse()?,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl FromStr for Order {
    type Err = QueryError;

    /// Parse `column`, `column.asc` or `column.desc`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, ascending) = match s.rsplit_once('.') {
            Some((column, "asc")) => (column, true),
            Some((column, "desc")) => (column, false),
            _ => (s, true),
        };
        if !is_valid_identifier(column) {
            return Err(QueryError::InvalidColumn(column.to_string()));
        }
        Ok(Order {
            column: column.to_string(),
            ascending,
        })
    }
}

/// A read of one table or view, evaluated server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportQuery {
    pub table: String,
    pub select: Vec<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl ReportQuery {
    pub fn new(table: impl Into<String>) -> Result<Self, QueryError> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(QueryError::InvalidTable(table));
        }
        Ok(Self {
            table,
            select: Vec::new(),
            filters: Vec::new(),
            order: None,
            limit: None,
        })
    }

    pub fn select<I, S>(mut self, columns: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if column != "*" && !is_valid_identifier(&column) {
                return Err(QueryError::InvalidColumn(column));
            }
            self.select.push(column);
        }
        Ok(self)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query-string pairs in PostgREST syntax.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();

        let select = if self.select.is_empty() {
            "*".to_string()
        } else {
            self.select.join(",")
        };
        pairs.push(("select".to_string(), select));

        for filter in &self.filters {
            pairs.push((
                filter.column.clone(),
                format!("{}.{}", filter.op.as_str(), filter.value),
            ));
        }

        if let Some(ref order) = self.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }

        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }

        pairs
    }

    /// Stable name for caching the result of this query.
    pub fn cache_key(&self) -> String {
        let mut key = format!("report_{}", self.table);
        for (name, value) in self.to_query_pairs() {
            if name == "select" && value == "*" {
                continue;
            }
            key.push('_');
            key.push_str(&name);
            key.push('-');
            key.push_str(&value);
        }
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for ReportQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let query: Vec<String> = self
            .to_query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        write!(f, "{}?{}", self.table, query.join("&"))
    }
}

/// Rows returned for a report query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub table: String,
    /// Union of row keys in first-seen order.
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub fetched_at: DateTime<Utc>,
}

impl Report {
    pub fn from_rows(table: impl Into<String>, rows: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        Self {
            table: table.into(),
            columns,
            rows,
            fetched_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Table and column names: ASCII letters, digits and underscores.
fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
