//! Persistence layer for completed conversions.
//!
//! Records live in a local SQLite-compatible database (libsql). They are
//! written once per successful conversion and never updated afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::Serialize;

use crate::conversion::ConversionStore;

/// One completed conversion as stored in the `conversions` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRecord {
    pub id: i64,
    pub source_url: String,
    pub title: String,
    pub output_file_name: String,
    pub file_path: String,
    pub created_at: String,
}

/// Fields supplied by the workflow; `id` and `created_at` are assigned here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversion {
    pub source_url: String,
    pub title: String,
    pub output_file_name: String,
    pub file_path: String,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS conversions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_url TEXT NOT NULL,
            title TEXT NOT NULL,
            output_file_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversions_file_name
            ON conversions(output_file_name);
        "#,
    )
    .await?;
    Ok(())
}

/// Handle on the conversion library database.
#[derive(Debug, Clone)]
pub struct ConversionLibrary {
    conn: Connection,
}

impl ConversionLibrary {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating library directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening library DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a record and returns it with its generated id and timestamp.
    pub async fn insert(&self, conversion: &NewConversion) -> Result<ConversionRecord> {
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut rows = self
            .conn
            .query(
                r#"
                INSERT INTO conversions (
                    source_url, title, output_file_name, file_path, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                RETURNING id
                "#,
                params![
                    conversion.source_url.as_str(),
                    conversion.title.as_str(),
                    conversion.output_file_name.as_str(),
                    conversion.file_path.as_str(),
                    created_at.as_str(),
                ],
            )
            .await
            .context("inserting conversion record")?;

        let row = rows
            .next()
            .await?
            .context("insert returned no id")?;
        let id: i64 = row.get(0)?;

        Ok(ConversionRecord {
            id,
            source_url: conversion.source_url.clone(),
            title: conversion.title.clone(),
            output_file_name: conversion.output_file_name.clone(),
            file_path: conversion.file_path.clone(),
            created_at,
        })
    }

    /// Every record, newest first.
    pub async fn list(&self) -> Result<Vec<ConversionRecord>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, source_url, title, output_file_name, file_path, created_at
                FROM conversions
                ORDER BY id DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ConversionRecord>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, source_url, title, output_file_name, file_path, created_at
                FROM conversions
                WHERE id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// All records pointing at `file_name`, newest first. Repeat conversions
    /// of one video share a file name.
    pub async fn find_by_file_name(&self, file_name: &str) -> Result<Vec<ConversionRecord>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, source_url, title, output_file_name, file_path, created_at
                FROM conversions
                WHERE output_file_name = ?1
                ORDER BY id DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query([file_name]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

impl ConversionStore for ConversionLibrary {
    async fn create(&self, conversion: NewConversion) -> Result<ConversionRecord> {
        self.insert(&conversion).await
    }
}

// Column order must match the SELECT statements above.
fn row_to_record(row: &Row) -> Result<ConversionRecord> {
    Ok(ConversionRecord {
        id: row.get(0)?,
        source_url: row.get(1)?,
        title: row.get(2)?,
        output_file_name: row.get(3)?,
        file_path: row.get(4)?,
        created_at: row.get(5)?,
    })
}
