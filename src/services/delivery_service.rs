use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::models::{
    db_timestamp,
    delivery_model::{DeliveryRecord, DeliveryRecordRow, DeliveryStatus, ListDeliveriesResponse},
    recipient_model::RecipientId,
};

/// Un destinatario del lote con su fila "pending" ya creada.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub delivery_id: String,
    pub recipient_id: RecipientId,
}

/// Bitácora por destinatario (tabla broadcast_deliveries).
#[derive(Clone, Debug)]
pub struct DeliveryService {
    db_pool: Pool<Sqlite>,
}

impl DeliveryService {
    pub fn new(db_pool: Pool<Sqlite>) -> Self {
        DeliveryService { db_pool }
    }

    /// Crea las filas "pending" del lote antes de enviar. Si el proceso muere
    /// a mitad del lote, estas filas indican qué envíos quedaron sin resultado.
    /// Falla si la difusión ya no pertenece a la ejecución `run_id`.
    pub async fn open_batch(
        &self,
        broadcast_id: i64,
        run_id: &str,
        recipients: &[RecipientId],
    ) -> Result<Vec<PendingDelivery>> {
        let now = db_timestamp(Utc::now());
        let mut tx = self.db_pool.begin().await?;

        let owned: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM broadcasts WHERE id = ?1 AND run_id = ?2 AND status = 'inprogress'",
        )
        .bind(broadcast_id)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Error verificando dueño del broadcast")?;
        if owned.is_none() {
            tx.rollback().await?;
            return Err(anyhow!(
                "Broadcast {} ya no pertenece a la ejecución {}; lote descartado",
                broadcast_id,
                run_id
            ));
        }
        let mut pending = Vec::with_capacity(recipients.len());

        for recipient_id in recipients {
            let delivery_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO broadcast_deliveries (
                    id, broadcast_id, recipient_id, status, error_message,
                    created_at, sent_at
                )
                VALUES (?1, ?2, ?3, 'pending', NULL, ?4, NULL)
                "#,
            )
            .bind(&delivery_id)
            .bind(broadcast_id)
            .bind(*recipient_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Error creando fila de bitácora")?;

            pending.push(PendingDelivery {
                delivery_id,
                recipient_id: *recipient_id,
            });
        }

        tx.commit().await?;
        Ok(pending)
    }

    /// Lista la bitácora de una difusión con paginación (y filtro opcional)
    pub async fn list_for_broadcast(
        &self,
        broadcast_id: i64,
        status: Option<DeliveryStatus>,
        page: u64,
        page_size: u64,
    ) -> Result<ListDeliveriesResponse> {
        let page = page.max(1);
        let offset = (page - 1).saturating_mul(page_size).min(i64::MAX as u64);
        let status_filter = status.map(|s| s.as_str());

        // total
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM broadcast_deliveries
            WHERE broadcast_id = ?1 AND (?2 IS NULL OR status = ?2)
            "#,
        )
        .bind(broadcast_id)
        .bind(status_filter)
        .fetch_one(&self.db_pool)
        .await
        .context("Fallo al contar bitácora")?;

        // items
        let rows: Vec<DeliveryRecordRow> = sqlx::query_as(
            r#"
            SELECT id, broadcast_id, recipient_id, status, error_message,
                   created_at, sent_at
            FROM broadcast_deliveries
            WHERE broadcast_id = ?1 AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(broadcast_id)
        .bind(status_filter)
        .bind(page_size.min(i64::MAX as u64) as i64)
        .bind(offset as i64)
        .fetch_all(&self.db_pool)
        .await
        .context("Fallo al listar bitácora")?;

        let items = rows
            .into_iter()
            .map(DeliveryRecord::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(ListDeliveriesResponse {
            total: total.max(0) as u64,
            page,
            page_size,
            items,
        })
    }

    pub async fn count_by_status(&self, broadcast_id: i64, status: DeliveryStatus) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM broadcast_deliveries WHERE broadcast_id = ?1 AND status = ?2",
        )
        .bind(broadcast_id)
        .bind(status.as_str())
        .fetch_one(&self.db_pool)
        .await
        .context("Fallo al contar bitácora por estado")?;
        Ok(count.max(0) as u64)
    }
}
