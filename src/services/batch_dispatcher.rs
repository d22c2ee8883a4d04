//! services/batch_dispatcher.rs
//! Ejecuta un lote de envíos en paralelo (con tope de workers y límite de
//! tasa) y espera a que todos terminen antes de devolver el resultado.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    config::dispatch_config::DispatchConfig,
    models::{broadcast_model::BroadcastContent, delivery_model::DeliveryOutcome},
    services::{
        broadcast_service::SettledDelivery, delivery_channel::DeliveryChannel,
        delivery_service::PendingDelivery,
    },
};

/// Resultado de un lote ya asentado.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub successful: u64,
    pub failed: u64,
    pub settled: Vec<SettledDelivery>,
}

#[derive(Clone)]
pub struct BatchDispatcher {
    channel: Arc<dyn DeliveryChannel>,
    workers: Arc<Semaphore>,
    limiter: Arc<DefaultDirectRateLimiter>,
    throttle_interval: Duration,
}

impl BatchDispatcher {
    pub fn new(channel: Arc<dyn DeliveryChannel>, config: &DispatchConfig) -> Self {
        let per_second = NonZeroU32::new(config.rate_limit).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(per_second);

        Self {
            channel,
            workers: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            limiter: Arc::new(RateLimiter::direct(quota)),
            throttle_interval: config.throttle_interval,
        }
    }

    /// Lanza un envío por destinatario y espera a que todos terminen.
    /// Un envío lento o fallido no afecta a los demás; si una tarea entra en
    /// pánico, ese destinatario cuenta como fallido.
    pub async fn dispatch_batch(
        &self,
        content: Arc<BroadcastContent>,
        batch: &[PendingDelivery],
    ) -> BatchResult {
        let mut tasks = JoinSet::new();

        for (index, delivery) in batch.iter().enumerate() {
            let channel = self.channel.clone();
            let workers = self.workers.clone();
            let limiter = self.limiter.clone();
            let content = content.clone();
            let recipient = delivery.recipient_id;

            tasks.spawn(async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, DeliveryOutcome::failed("pool de envíos cerrado")),
                };
                limiter.until_ready().await;
                (index, channel.send(recipient, &content).await)
            });
        }

        // Barrera: nada del siguiente lote arranca hasta vaciar este JoinSet
        let mut outcomes: Vec<Option<DeliveryOutcome>> = vec![None; batch.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => log::error!("(dispatch_batch) tarea de envío abortada: {}", e),
            }
        }

        let mut result = BatchResult::default();
        for (delivery, outcome) in batch.iter().zip(outcomes) {
            let outcome =
                outcome.unwrap_or_else(|| DeliveryOutcome::failed("la tarea de envío terminó sin resultado"));
            if outcome.is_sent() {
                result.successful += 1;
            } else {
                result.failed += 1;
            }
            result.settled.push(SettledDelivery {
                delivery_id: delivery.delivery_id.clone(),
                outcome,
            });
        }
        result
    }

    /// Pausa entre lotes. Devuelve `false` si se canceló durante la espera.
    pub async fn throttle(&self, cancel: &CancellationToken) -> bool {
        if self.throttle_interval.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.throttle_interval) => true,
        }
    }
}
