//! CRUD operations for [`Account`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Account;

impl Database {
    /// Insert a new account. Fails with a constraint error if the email is
    /// already registered.
    pub fn insert_account(&self, account: &Account) -> Result<()> {
        self.conn().execute(
            "INSERT INTO accounts (uid, email, display_name, secret_hash, salt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account.uid,
                account.email.to_lowercase(),
                account.display_name,
                account.secret_hash,
                account.salt,
                account.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_account_by_email(&self, email: &str) -> Result<Account> {
        self.conn()
            .query_row(
                "SELECT uid, email, display_name, secret_hash, salt, created_at
                 FROM accounts WHERE email = ?1",
                params![email.to_lowercase()],
                row_to_account,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn get_account(&self, uid: &str) -> Result<Account> {
        self.conn()
            .query_row(
                "SELECT uid, email, display_name, secret_hash, salt, created_at
                 FROM accounts WHERE uid = ?1",
                params![uid],
                row_to_account,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn email_registered(&self, email: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM accounts WHERE email = ?1",
            params![email.to_lowercase()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let created_str: String = row.get(5)?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Account {
        uid: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        secret_hash: row.get(3)?,
        salt: row.get(4)?,
        created_at,
    })
}
