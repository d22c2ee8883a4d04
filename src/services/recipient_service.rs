use std::collections::HashSet;

use anyhow::{Context, Result};
use sqlx::{Pool, QueryBuilder, Sqlite};

use crate::models::recipient_model::RecipientId;

/// SQLite admite un número limitado de parámetros por sentencia.
const LOOKUP_CHUNK: usize = 500;

/// Lectura del registro de destinatarios (solo lectura para el motor).
#[derive(Clone, Debug)]
pub struct RecipientService {
    db_pool: Pool<Sqlite>,
}

impl RecipientService {
    pub fn new(db_pool: Pool<Sqlite>) -> Self {
        RecipientService { db_pool }
    }

    /// Cuenta los destinatarios registrados que no están bloqueados.
    pub async fn count_deliverable(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM recipients WHERE blocked = 0")
                .fetch_one(&self.db_pool)
                .await
                .context("Fallo al contar destinatarios")?;
        Ok(count.max(0) as u64)
    }

    /// Página de ids no bloqueados, estrictamente mayores que `after`
    /// (paginación por cursor, ordenada por telegram_id).
    pub async fn fetch_page(
        &self,
        after: Option<RecipientId>,
        limit: usize,
    ) -> Result<Vec<RecipientId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT telegram_id FROM recipients
            WHERE blocked = 0 AND telegram_id > ?1
            ORDER BY telegram_id ASC
            LIMIT ?2
            "#,
        )
        .bind(after.unwrap_or(i64::MIN))
        .bind(limit as i64)
        .fetch_all(&self.db_pool)
        .await
        .context("Fallo al leer página de destinatarios")?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// De la lista dada, cuáles están marcados como bloqueados.
    pub async fn blocked_among(&self, ids: &[RecipientId]) -> Result<HashSet<RecipientId>> {
        let mut blocked = HashSet::new();

        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT telegram_id FROM recipients WHERE blocked = 1 AND telegram_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows: Vec<(i64,)> = builder
                .build_query_as()
                .fetch_all(&self.db_pool)
                .await
                .context("Fallo al consultar destinatarios bloqueados")?;
            blocked.extend(rows.into_iter().map(|(id,)| id));
        }

        Ok(blocked)
    }
}
