//! Dialect tag for the source databases `SourceProviderImpl` knows how to
//! talk to. Locking and `RETURNING`-equivalent clauses differ enough
//! per-dialect (Postgres CTE+`RETURNING`, MySQL select-then-update, MSSQL
//! `OUTPUT`, Oracle positional binds) that the provider writes each
//! dialect's claim SQL inline rather than through a shared template; this
//! tag is what it matches on to pick the right `SourceBackend` arm.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDialect {
    Postgres,
    MySql,
    Mssql,
    Oracle,
}
