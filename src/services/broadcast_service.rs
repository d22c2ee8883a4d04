use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::models::{
    broadcast_model::{Broadcast, BroadcastRow},
    db_timestamp,
    delivery_model::{DeliveryOutcome, DeliveryStatus},
};

const BROADCAST_COLUMNS: &str = r#"
    id, message, message_type, file_id, buttons, recipients, status, run_id,
    created_at, claimed_at, heartbeat_at, completed_at,
    total_target, total_successful, total_failed
"#;

/// Resultado de un envío ya asociado a su fila de bitácora.
#[derive(Debug, Clone)]
pub struct SettledDelivery {
    pub delivery_id: String,
    pub outcome: DeliveryOutcome,
}

#[derive(Clone, Debug)]
pub struct BroadcastService {
    db_pool: Pool<Sqlite>,
}

impl BroadcastService {
    pub fn new(db_pool: Pool<Sqlite>) -> Self {
        BroadcastService { db_pool }
    }

    /// Corre migraciones con sqlx
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db_pool)
            .await
            .context("Fallo en migraciones de 'broadcasts'")?;
        Ok(())
    }

    /// Toma la difusión "pending" más antigua y la pasa a "inprogress" en una
    /// sola sentencia. Si otro worker la tomó antes, no devuelve nada.
    /// Al reclamarla se genera un `run_id` nuevo, se reinician contadores y se
    /// borra la bitácora previa. Una fila que no se puede decodificar se cierra
    /// como "completed" con 0/0 y se pasa a la siguiente.
    pub async fn claim_next_pending(&self) -> Result<Option<Broadcast>> {
        loop {
            let now = db_timestamp(Utc::now());
            let run_id = Uuid::new_v4().to_string();
            let mut tx = self.db_pool.begin().await?;

            let sql = format!(
                r#"
                UPDATE broadcasts
                SET status = 'inprogress',
                    run_id = ?2,
                    claimed_at = ?1,
                    heartbeat_at = ?1,
                    completed_at = NULL,
                    total_target = 0,
                    total_successful = 0,
                    total_failed = 0
                WHERE id = (
                    SELECT id FROM broadcasts
                    WHERE status = 'pending'
                    ORDER BY created_at ASC, id ASC
                    LIMIT 1
                )
                AND status = 'pending'
                RETURNING {BROADCAST_COLUMNS}
                "#
            );

            let row: Option<BroadcastRow> = sqlx::query_as(&sql)
                .bind(&now)
                .bind(&run_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Fallo al reclamar broadcast pendiente")?;

            let Some(row) = row else {
                tx.rollback().await?;
                return Ok(None);
            };
            let broadcast_id = row.id;

            // Restos de una ejecución anterior (reclamada por lease)
            sqlx::query("DELETE FROM broadcast_deliveries WHERE broadcast_id = ?1")
                .bind(broadcast_id)
                .execute(&mut *tx)
                .await
                .context("Fallo al limpiar bitácora previa")?;

            match Broadcast::try_from(row) {
                Ok(broadcast) => {
                    tx.commit().await?;
                    return Ok(Some(broadcast));
                }
                Err(e) => {
                    log::error!(
                        "(claim_next_pending) Broadcast {} ilegible, se cierra sin envíos: {:#}",
                        broadcast_id,
                        e
                    );
                    sqlx::query(
                        r#"
                        UPDATE broadcasts
                        SET status = 'completed',
                            run_id = NULL,
                            completed_at = ?2
                        WHERE id = ?1
                        "#,
                    )
                    .bind(broadcast_id)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await
                    .context("Fallo al cerrar broadcast ilegible")?;
                    tx.commit().await?;
                }
            }
        }
    }

    /// Fija el total de destinatarios. Solo se llama una vez por ejecución.
    pub async fn set_total_target(
        &self,
        broadcast_id: i64,
        run_id: &str,
        total_target: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET total_target = ?3
            WHERE id = ?1 AND run_id = ?2 AND status = 'inprogress'
            "#,
        )
        .bind(broadcast_id)
        .bind(run_id)
        .bind(total_target as i64)
        .execute(&self.db_pool)
        .await
        .context("Fallo al guardar total_target")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "Broadcast {} no está en progreso para la ejecución {}; no se puede fijar total_target",
                broadcast_id,
                run_id
            ));
        }
        Ok(())
    }

    /// Guarda los contadores acumulados (sobrescribe, es idempotente), refresca
    /// el latido y cierra las filas de bitácora del lote, todo en una transacción.
    /// Solo la ejecución que tiene el reclamo (`run_id`) puede escribir.
    pub async fn checkpoint(
        &self,
        broadcast_id: i64,
        run_id: &str,
        successful: u64,
        failed: u64,
        settled: &[SettledDelivery],
    ) -> Result<()> {
        let now = db_timestamp(Utc::now());
        let mut tx = self.db_pool.begin().await?;

        for delivery in settled {
            let (status, error_message, sent_at) = match &delivery.outcome {
                DeliveryOutcome::Sent => (DeliveryStatus::Sent, None, Some(now.as_str())),
                DeliveryOutcome::Failed { reason } => {
                    (DeliveryStatus::Failed, Some(reason.as_str()), None)
                }
            };
            sqlx::query(
                r#"
                UPDATE broadcast_deliveries
                SET status = ?2,
                    error_message = ?3,
                    sent_at = ?4
                WHERE id = ?1 AND broadcast_id = ?5
                "#,
            )
            .bind(&delivery.delivery_id)
            .bind(status.as_str())
            .bind(error_message)
            .bind(sent_at)
            .bind(broadcast_id)
            .execute(&mut *tx)
            .await
            .context("Fallo al actualizar bitácora de entrega")?;
        }

        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET total_successful = ?3,
                total_failed = ?4,
                heartbeat_at = ?5
            WHERE id = ?1 AND run_id = ?2 AND status = 'inprogress'
            "#,
        )
        .bind(broadcast_id)
        .bind(run_id)
        .bind(successful as i64)
        .bind(failed as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("Fallo al guardar progreso")?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(anyhow!(
                "Broadcast {} ya no pertenece a la ejecución {}; checkpoint descartado",
                broadcast_id,
                run_id
            ));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Último guardado de contadores y paso a "completed".
    pub async fn finalize(
        &self,
        broadcast_id: i64,
        run_id: &str,
        successful: u64,
        failed: u64,
    ) -> Result<()> {
        let now = db_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET total_successful = ?3,
                total_failed = ?4,
                status = 'completed',
                heartbeat_at = ?5,
                completed_at = ?5
            WHERE id = ?1 AND run_id = ?2 AND status = 'inprogress'
            "#,
        )
        .bind(broadcast_id)
        .bind(run_id)
        .bind(successful as i64)
        .bind(failed as i64)
        .bind(&now)
        .execute(&self.db_pool)
        .await
        .context("Fallo al completar broadcast")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "Broadcast {} ya no pertenece a la ejecución {}; no se marcó como completado",
                broadcast_id,
                run_id
            ));
        }
        Ok(())
    }

    /// Obtiene una difusión por id
    pub async fn get_broadcast(&self, broadcast_id: i64) -> Result<Option<Broadcast>> {
        let sql = format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?1");
        let row: Option<BroadcastRow> = sqlx::query_as(&sql)
            .bind(broadcast_id)
            .fetch_optional(&self.db_pool)
            .await
            .context("Fallo al consultar broadcast")?;

        row.map(Broadcast::try_from).transpose()
    }

    /// Devuelve a "pending" las difusiones "inprogress" cuyo último latido es
    /// más viejo que `lease`. Retorna cuántas se reencolaron.
    pub async fn reclaim_stale(&self, lease: Duration) -> Result<u64> {
        let lease = chrono::Duration::from_std(lease).context("Lease fuera de rango")?;
        let cutoff = db_timestamp(Utc::now() - lease);

        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET status = 'pending',
                run_id = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL
            WHERE status = 'inprogress'
              AND (heartbeat_at IS NULL OR heartbeat_at < ?1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.db_pool)
        .await
        .context("Fallo al reencolar broadcasts vencidos")?;

        Ok(result.rows_affected())
    }
}
