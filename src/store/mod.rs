//! Persistence layer: libSQL-backed keyed record store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{RecordStore, get_record, kinds, list_records, put_record};
