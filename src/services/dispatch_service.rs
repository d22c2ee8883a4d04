//! services/dispatch_service.rs
//! Bucle principal: reclama la difusión pendiente más antigua, la envía por
//! lotes y vuelve a consultar.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use sqlx::{Pool, Sqlite};
use tokio_util::sync::CancellationToken;

use crate::{
    config::dispatch_config::DispatchConfig,
    models::broadcast_model::Broadcast,
    services::{
        batch_dispatcher::BatchDispatcher, broadcast_service::BroadcastService,
        delivery_channel::DeliveryChannel, delivery_service::DeliveryService,
        progress_tracker::ProgressTracker, recipient_service::RecipientService,
        recipient_source::RecipientSource,
    },
};

/// Cómo terminó el procesamiento de una difusión.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Cancelado entre lotes; queda "inprogress" con el último checkpoint.
    Interrupted,
}

#[derive(Clone)]
pub struct DispatchService {
    broadcast_service: BroadcastService,
    recipient_service: RecipientService,
    delivery_service: DeliveryService,
    dispatcher: BatchDispatcher,
    config: DispatchConfig,
}

impl DispatchService {
    pub fn new(
        db_pool: Pool<Sqlite>,
        channel: Arc<dyn DeliveryChannel>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            broadcast_service: BroadcastService::new(db_pool.clone()),
            recipient_service: RecipientService::new(db_pool.clone()),
            delivery_service: DeliveryService::new(db_pool),
            dispatcher: BatchDispatcher::new(channel, &config),
            config,
        }
    }

    /// Corre hasta que se cancele el token. Una difusión a la vez.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        log::info!(
            "(run) Iniciando despachador: lote={}, workers={}, tasa={}/s",
            self.config.batch_size,
            self.config.max_concurrency,
            self.config.rate_limit
        );

        while !cancel.is_cancelled() {
            match self.poll_once(&cancel).await {
                // Hubo trabajo: consultar de nuevo sin esperar
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => log::error!("(run) Error procesando broadcast: {:?}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
            }
        }

        log::info!("(run) Despachador detenido.");
        Ok(())
    }

    /// Una iteración del bucle: reencola vencidas (si hay lease), reclama la
    /// pendiente más antigua y la procesa. `None` si no había nada.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<Option<(i64, RunOutcome)>> {
        if let Some(lease) = self.config.lease_timeout {
            let reclaimed = self.broadcast_service.reclaim_stale(lease).await?;
            if reclaimed > 0 {
                log::warn!("(poll_once) {} broadcasts sin latido devueltos a 'pending'", reclaimed);
            }
        }

        let Some(broadcast) = self.broadcast_service.claim_next_pending().await? else {
            log::debug!("(poll_once) No hay broadcasts pendientes.");
            return Ok(None);
        };

        let broadcast_id = broadcast.id;
        let outcome = self.process_broadcast(broadcast, cancel).await?;
        Ok(Some((broadcast_id, outcome)))
    }

    /// Envía una difusión ya reclamada hasta el final (o hasta cancelación).
    pub async fn process_broadcast(
        &self,
        broadcast: Broadcast,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let broadcast_id = broadcast.id;
        let run_id = broadcast
            .run_id
            .clone()
            .ok_or_else(|| anyhow!("Broadcast {} no fue reclamado (sin run_id)", broadcast_id))?;
        log::info!(
            "(process_broadcast) Procesando broadcast ID: {} (ejecución {})",
            broadcast_id,
            run_id
        );

        let mut source = RecipientSource::open(&self.recipient_service, &broadcast).await?;
        let total_target = source.total();
        self.broadcast_service
            .set_total_target(broadcast_id, &run_id, total_target)
            .await?;

        let mut tracker = ProgressTracker::new(
            self.broadcast_service.clone(),
            broadcast_id,
            run_id.clone(),
            total_target,
            self.config.checkpoint_retries,
        );
        let content = Arc::new(broadcast.content);

        let mut batch_no = 0u64;
        let mut next = source.next_batch(self.config.batch_size).await?;
        while !next.is_empty() {
            if cancel.is_cancelled() {
                return Ok(self.interrupted(&tracker, broadcast_id));
            }

            batch_no += 1;
            log::info!(
                "(process_broadcast) broadcast={} lote {} con {} destinatarios...",
                broadcast_id,
                batch_no,
                next.len()
            );

            let pending = self
                .delivery_service
                .open_batch(broadcast_id, &run_id, &next)
                .await?;
            let result = self.dispatcher.dispatch_batch(content.clone(), &pending).await;
            tracker.record(&result);
            tracker.checkpoint(&result.settled).await?;

            log::info!(
                "(process_broadcast) broadcast={} lote {}: {} ok, {} fallidos (acumulado {}/{})",
                broadcast_id,
                batch_no,
                result.successful,
                result.failed,
                tracker.attempted(),
                total_target
            );

            next = source.next_batch(self.config.batch_size).await?;
            if !next.is_empty() && !self.dispatcher.throttle(cancel).await {
                return Ok(self.interrupted(&tracker, broadcast_id));
            }
        }

        tracker.finalize().await?;
        log::info!(
            "(process_broadcast) Broadcast {} completed: {} successful, {} failed.",
            broadcast_id,
            tracker.successful(),
            tracker.failed()
        );
        Ok(RunOutcome::Completed)
    }

    fn interrupted(&self, tracker: &ProgressTracker, broadcast_id: i64) -> RunOutcome {
        log::warn!(
            "(process_broadcast) Cancelado: broadcast {} queda 'inprogress' con {} ok / {} fallidos",
            broadcast_id,
            tracker.successful(),
            tracker.failed()
        );
        RunOutcome::Interrupted
    }
}
