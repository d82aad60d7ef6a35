pub mod app;

// Re-export useful types for library users
pub use app::config::Settings;
pub use app::db::{Backend, Connection, QueryOutcome, SqlExecutor, SqlParam, StatementKind};
pub use app::error::{DbError, QueryFileError, ReportError};
pub use app::formatter::OutputGenerator;
pub use app::inspector::Inspector;
pub use app::models::{
    ColumnDescriptor, ForeignKeyDescriptor, ReferenceRow, RelationshipEdge, SchemaAnalysis, Table,
    TableDescriptor, Value,
};
pub use app::{
    QueryResults, SavedResults, generate_report, run_query, save_query_results, write_reports,
};
