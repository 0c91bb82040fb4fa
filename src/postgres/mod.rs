// Postgres statement plumbing shared by the executor and transaction handles:
// - params: `RowValues` to `ToSql` conversion
// - query: statement execution and result set building

pub mod params;
pub mod query;

pub use params::Params;
pub use query::{build_result_set, execute_batch, execute_dml, execute_select, postgres_extract_value};
