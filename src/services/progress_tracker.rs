use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::services::{
    batch_dispatcher::BatchResult,
    broadcast_service::{BroadcastService, SettledDelivery},
};

const RETRY_STEP: Duration = Duration::from_millis(200);

/// Contadores acumulados de una ejecución, guardados después de cada lote.
pub struct ProgressTracker {
    broadcast_service: BroadcastService,
    broadcast_id: i64,
    run_id: String,
    total_target: u64,
    successful: u64,
    failed: u64,
    retries: u32,
}

impl ProgressTracker {
    pub fn new(
        broadcast_service: BroadcastService,
        broadcast_id: i64,
        run_id: String,
        total_target: u64,
        retries: u32,
    ) -> Self {
        Self {
            broadcast_service,
            broadcast_id,
            run_id,
            total_target,
            successful: 0,
            failed: 0,
            retries,
        }
    }

    /// Suma el resultado de un lote a los contadores en memoria.
    pub fn record(&mut self, result: &BatchResult) {
        self.successful += result.successful;
        self.failed += result.failed;
        if self.attempted() > self.total_target {
            log::error!(
                "(ProgressTracker::record) broadcast={} intentados={} superan total_target={}",
                self.broadcast_id,
                self.attempted(),
                self.total_target
            );
        }
    }

    pub fn successful(&self) -> u64 {
        self.successful
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn attempted(&self) -> u64 {
        self.successful + self.failed
    }

    /// Guarda contadores y bitácora del lote. Reintenta antes de abortar la
    /// ejecución; nunca se descarta un checkpoint en silencio.
    pub async fn checkpoint(&self, settled: &[SettledDelivery]) -> Result<()> {
        self.with_retries("checkpoint", || {
            self.broadcast_service.checkpoint(
                self.broadcast_id,
                &self.run_id,
                self.successful,
                self.failed,
                settled,
            )
        })
        .await
    }

    /// Último guardado y paso a "completed".
    pub async fn finalize(&self) -> Result<()> {
        self.with_retries("finalize", || {
            self.broadcast_service
                .finalize(self.broadcast_id, &self.run_id, self.successful, self.failed)
        })
        .await
    }

    async fn with_retries<F, Fut>(&self, op: &str, mut write: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 0u32;
        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "(ProgressTracker::{}) broadcast={} intento {} falló: {:?}",
                        op,
                        self.broadcast_id,
                        attempt,
                        e
                    );
                    tokio::time::sleep(RETRY_STEP * attempt).await;
                }
                Err(e) => {
                    log::error!(
                        "(ProgressTracker::{}) broadcast={} sin más reintentos: {:?}",
                        op,
                        self.broadcast_id,
                        e
                    );
                    return Err(e).with_context(|| {
                        format!("No se pudo guardar el progreso del broadcast {}", self.broadcast_id)
                    });
                }
            }
        }
    }
}
