//! Document metadata operations: listing, updates, relations, validation.
//!
//! Documents are created by ingestion; these operations curate their
//! metadata afterwards and maintain the typed relation edges the query
//! engine traverses for aligned enrichment.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, Result};
use crate::models::{DocRelation, DocRole, RelationType};

/// One row of the document listing, with unit counts.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub doc_id: i64,
    pub title: String,
    pub language: String,
    pub role: DocRole,
    pub resource_type: String,
    pub source_path: String,
    pub created_at: i64,
    pub units_total: i64,
    pub units_line: i64,
}

/// Lists all documents with their unit counts.
pub async fn list_documents(pool: &SqlitePool) -> Result<Vec<DocumentSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT d.id, d.title, d.language, d.role, d.resource_type, d.source_path, d.created_at,
               COUNT(u.id) AS units_total,
               COALESCE(SUM(CASE WHEN u.kind = 'line' THEN 1 ELSE 0 END), 0) AS units_line
        FROM documents d
        LEFT JOIN units u ON u.doc_id = d.id
        GROUP BY d.id
        ORDER BY d.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let role: String = row.get("role");
        out.push(DocumentSummary {
            doc_id: row.get("id"),
            title: row.get("title"),
            language: row.get("language"),
            role: DocRole::parse(&role)?,
            resource_type: row.get("resource_type"),
            source_path: row.get("source_path"),
            created_at: row.get("created_at"),
            units_total: row.get("units_total"),
            units_line: row.get("units_line"),
        });
    }
    Ok(out)
}

/// Metadata fields that can be updated on a document. Absent fields stay
/// untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentUpdate {
    pub doc_id: i64,
    pub title: Option<String>,
    pub language: Option<String>,
    pub role: Option<String>,
    pub resource_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Applies one metadata update.
pub async fn update_document(pool: &SqlitePool, update: &DocumentUpdate) -> Result<()> {
    ensure_document(pool, update.doc_id).await?;

    if let Some(role) = &update.role {
        DocRole::parse(role)?;
    }
    if let Some(metadata) = &update.metadata {
        if !metadata.is_object() {
            return Err(EngineError::validation(
                "document metadata must be a JSON object",
            ));
        }
    }

    if let Some(title) = &update.title {
        sqlx::query("UPDATE documents SET title = ? WHERE id = ?")
            .bind(title)
            .bind(update.doc_id)
            .execute(pool)
            .await?;
    }
    if let Some(language) = &update.language {
        sqlx::query("UPDATE documents SET language = ? WHERE id = ?")
            .bind(language)
            .bind(update.doc_id)
            .execute(pool)
            .await?;
    }
    if let Some(role) = &update.role {
        sqlx::query("UPDATE documents SET role = ? WHERE id = ?")
            .bind(role)
            .bind(update.doc_id)
            .execute(pool)
            .await?;
    }
    if let Some(resource_type) = &update.resource_type {
        sqlx::query("UPDATE documents SET resource_type = ? WHERE id = ?")
            .bind(resource_type)
            .bind(update.doc_id)
            .execute(pool)
            .await?;
    }
    if let Some(metadata) = &update.metadata {
        sqlx::query("UPDATE documents SET metadata_json = ? WHERE id = ?")
            .bind(metadata.to_string())
            .bind(update.doc_id)
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Applies many updates; validates all of them before writing any.
pub async fn bulk_update_documents(pool: &SqlitePool, updates: &[DocumentUpdate]) -> Result<usize> {
    for update in updates {
        ensure_document(pool, update.doc_id).await?;
        if let Some(role) = &update.role {
            DocRole::parse(role)?;
        }
        if let Some(metadata) = &update.metadata {
            if !metadata.is_object() {
                return Err(EngineError::validation(
                    "document metadata must be a JSON object",
                ));
            }
        }
    }
    for update in updates {
        update_document(pool, update).await?;
    }
    Ok(updates.len())
}

/// Lists relations where the document is either endpoint.
pub async fn list_relations(pool: &SqlitePool, doc_id: i64) -> Result<Vec<DocRelation>> {
    ensure_document(pool, doc_id).await?;
    let rows = sqlx::query(
        "SELECT id, doc_id, relation_type, target_doc_id, note FROM doc_relations \
         WHERE doc_id = ? OR target_doc_id = ? ORDER BY id",
    )
    .bind(doc_id)
    .bind(doc_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let relation_type: String = row.get("relation_type");
        out.push(DocRelation {
            id: row.get("id"),
            doc_id: row.get("doc_id"),
            relation_type: RelationType::parse(&relation_type)?,
            target_doc_id: row.get("target_doc_id"),
            note: row.get("note"),
        });
    }
    Ok(out)
}

/// Upserts a relation; the `(doc, type, target)` triple is unique and an
/// upsert refreshes the note.
pub async fn set_relation(
    pool: &SqlitePool,
    doc_id: i64,
    relation_type: RelationType,
    target_doc_id: i64,
    note: Option<&str>,
) -> Result<i64> {
    if doc_id == target_doc_id {
        return Err(EngineError::validation(
            "a document cannot relate to itself",
        ));
    }
    ensure_document(pool, doc_id).await?;
    ensure_document(pool, target_doc_id).await?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO doc_relations (doc_id, relation_type, target_doc_id, note)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(doc_id, relation_type, target_doc_id) DO UPDATE SET note = excluded.note
        RETURNING id
        "#,
    )
    .bind(doc_id)
    .bind(relation_type.as_str())
    .bind(target_doc_id)
    .bind(note)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Deletes a relation by id.
pub async fn delete_relation(pool: &SqlitePool, relation_id: i64) -> Result<()> {
    let affected = sqlx::query("DELETE FROM doc_relations WHERE id = ?")
        .bind(relation_id)
        .execute(pool)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(EngineError::not_found(format!(
            "unknown relation: {}",
            relation_id
        )));
    }
    Ok(())
}

/// Issues found on one document by `validate-meta`.
#[derive(Debug, Clone, Serialize)]
pub struct MetaValidation {
    pub doc_id: i64,
    pub title: String,
    pub issues: Vec<String>,
}

/// Checks every document (or one) for metadata problems. Issues are
/// warnings: they never fail the call.
pub async fn validate_meta(pool: &SqlitePool, doc_id: Option<i64>) -> Result<Vec<MetaValidation>> {
    if let Some(doc_id) = doc_id {
        ensure_document(pool, doc_id).await?;
    }
    let rows = match doc_id {
        Some(doc_id) => {
            sqlx::query("SELECT id, title, language, resource_type, metadata_json FROM documents WHERE id = ?")
                .bind(doc_id)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT id, title, language, resource_type, metadata_json FROM documents ORDER BY id")
                .fetch_all(pool)
                .await?
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let title: String = row.get("title");
        let language: String = row.get("language");
        let resource_type: String = row.get("resource_type");
        let metadata_json: String = row.get("metadata_json");

        let mut issues = Vec::new();
        if title.trim().is_empty() {
            issues.push("title is empty".to_string());
        }
        if language.trim().is_empty() || language == "und" {
            issues.push("language is undetermined".to_string());
        } else if !is_language_tag(&language) {
            issues.push(format!("language '{}' is not a plausible tag", language));
        }
        if resource_type.trim().is_empty() {
            issues.push("resource_type is empty".to_string());
        }
        if serde_json::from_str::<serde_json::Value>(&metadata_json).is_err() {
            issues.push("metadata is not valid JSON".to_string());
        }

        out.push(MetaValidation {
            doc_id: row.get("id"),
            title,
            issues,
        });
    }
    Ok(out)
}

/// Loose BCP-47 shape: 2-3 letter primary tag, optional subtags.
fn is_language_tag(s: &str) -> bool {
    let mut parts = s.split('-');
    let Some(primary) = parts.next() else {
        return false;
    };
    if !(2..=3).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    parts.all(|p| !p.is_empty() && p.len() <= 8 && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

async fn ensure_document(pool: &SqlitePool, doc_id: i64) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
        .bind(doc_id)
        .fetch_one(pool)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "unknown document: {}",
            doc_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_tag_shapes() {
        assert!(is_language_tag("fr"));
        assert!(is_language_tag("grc"));
        assert!(is_language_tag("fr-CA"));
        assert!(is_language_tag("zh-Hant"));
        assert!(!is_language_tag("f"));
        assert!(!is_language_tag("français"));
        assert!(!is_language_tag(""));
    }
}
