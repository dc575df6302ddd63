//! Versioned sqlite stores
//!
//! Every persistent store carries a singleton `dbversion` row naming its
//! schema version and purpose. A store opened for a different purpose or
//! version is refused; a fresh file gets its schema created.

use rusqlite::Connection;

use crate::traits::StoreError;

/// Verify the version stamp of an already opened store.
///
/// Returns `Ok(true)` when the store is usable, `Ok(false)` when the
/// `dbversion` table is missing and the schema needs to be created, and an
/// error when the store belongs to another purpose or version.
pub fn check_database(conn: &Connection, purpose: &str) -> Result<bool, StoreError> {
    let row = conn.query_row(
        "SELECT version, installdate, purpose FROM dbversion",
        [],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(2)?)),
    );
    match row {
        Ok((version, actual)) => {
            if actual != purpose {
                tracing::error!("Database has wrong purpose, expected {} but got {}", purpose, actual);
                return Err(StoreError::WrongPurpose {
                    expected: purpose.to_string(),
                    actual,
                });
            }
            if version != 1 {
                tracing::error!("Database has wrong version, expected 1 but got {}", version);
                return Err(StoreError::WrongVersion(version));
            }
            Ok(true)
        }
        Err(err) => {
            tracing::info!("Database check failed: {}", err);
            Ok(false)
        }
    }
}

/// Create the schema and insert the version stamp.
pub fn setup_database(conn: &Connection, ddl: &[&str], purpose: &str) -> Result<(), StoreError> {
    for statement in ddl {
        tracing::debug!("DDL {}", statement);
        conn.execute(statement, [])
            .map_err(|e| StoreError::SetupFailed(e.to_string()))?;
    }
    conn.execute(
        "INSERT INTO dbversion(version, installdate, purpose) \
         VALUES(1, strftime('%Y-%m-%d %H-%M-%f','now'), ?1)",
        [purpose],
    )
    .map_err(|e| StoreError::SetupFailed(e.to_string()))?;
    Ok(())
}

/// Open a store, verifying its stamp and creating the schema when missing.
pub fn open_versioned(dbname: &str, purpose: &str, ddl: &[&str]) -> Result<Connection, StoreError> {
    tracing::debug!("Try to open database '{}'", dbname);
    let conn = Connection::open(dbname)?;
    if check_database(&conn, purpose)? {
        tracing::info!("Database {} looks OK", dbname);
    } else {
        tracing::info!("Create new database {}", dbname);
        setup_database(&conn, ddl, purpose)?;
    }
    Ok(conn)
}
