//! Subscriber identity and interest filters.

use std::fmt;

use pulse_proto::ChangeEvent;

/// Unique identifier of a live subscriber connection.
pub type SubscriberId = u64;

/// What a subscriber wants to hear about.
///
/// Fixed when the connection is accepted and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Every change on every table.
    AllTables,
    /// Every change on one table.
    Table(String),
    /// Changes to a single row of one table.
    TableAndRow { table: String, row_id: String },
}

impl Filter {
    /// Build a filter from the request path segments.
    ///
    /// Empty segments count as absent. A row segment without a table
    /// segment cannot be expressed by the routes and falls back to
    /// [`Filter::AllTables`].
    pub fn from_segments(table: Option<&str>, row_id: Option<&str>) -> Self {
        let table = table.filter(|t| !t.is_empty());
        let row_id = row_id.filter(|r| !r.is_empty());

        match (table, row_id) {
            (Some(table), Some(row_id)) => Filter::TableAndRow {
                table: table.to_string(),
                row_id: row_id.to_string(),
            },
            (Some(table), None) => Filter::Table(table.to_string()),
            (None, _) => Filter::AllTables,
        }
    }

    /// Check whether an event is of interest to this filter.
    ///
    /// A row-scoped filter never matches an event without a row identity.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Filter::AllTables => true,
            Filter::Table(table) => event.table == *table,
            Filter::TableAndRow { table, row_id } => {
                event.table == *table && event.row_id.as_deref() == Some(row_id.as_str())
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::AllTables => f.write_str("*"),
            Filter::Table(table) => write!(f, "{}", table),
            Filter::TableAndRow { table, row_id } => write!(f, "{}/{}", table, row_id),
        }
    }
}
