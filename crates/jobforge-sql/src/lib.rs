//! SQL-backed `JobStore` drivers, one module per dialect, each gated by
//! its own cargo feature so a binary only pulls in the sqlx backend it
//! actually needs — the same pattern sqlx itself uses for its own
//! backends.

mod row;
mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::{PgJobStore, PostgresDriverFactory};
#[cfg(feature = "mysql")]
pub use mysql::{MysqlDriverFactory, MysqlJobStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteDriverFactory, SqliteJobStore};
