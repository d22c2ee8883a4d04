//! services/recipient_source.rs
//! Secuencia de destinatarios de una difusión, consumida por lotes.

use anyhow::Result;

use crate::{
    models::{broadcast_model::Broadcast, recipient_model::RecipientId},
    services::recipient_service::RecipientService,
};

enum Cursor {
    /// Lista fija guardada en la difusión (ya sin bloqueados).
    Explicit(std::vec::IntoIter<RecipientId>),
    /// Todos los registrados, leídos por páginas.
    Registry {
        service: RecipientService,
        after: Option<RecipientId>,
        exhausted: bool,
    },
}

pub struct RecipientSource {
    cursor: Cursor,
    total: u64,
    yielded: u64,
}

impl RecipientSource {
    /// Prepara la secuencia y fija el total. Los bloqueados se excluyen siempre.
    pub async fn open(service: &RecipientService, broadcast: &Broadcast) -> Result<Self> {
        match &broadcast.recipients {
            Some(ids) => {
                let blocked = service.blocked_among(ids).await?;
                let deliverable: Vec<RecipientId> = ids
                    .iter()
                    .copied()
                    .filter(|id| !blocked.contains(id))
                    .collect();
                if deliverable.len() < ids.len() {
                    log::info!(
                        "(RecipientSource::open) broadcast={} omitiendo {} destinatarios bloqueados",
                        broadcast.id,
                        ids.len() - deliverable.len()
                    );
                }
                let ids = deliverable;
                Ok(RecipientSource {
                    total: ids.len() as u64,
                    cursor: Cursor::Explicit(ids.into_iter()),
                    yielded: 0,
                })
            }
            None => {
                let total = service.count_deliverable().await?;
                Ok(RecipientSource {
                    total,
                    cursor: Cursor::Registry {
                        service: service.clone(),
                        after: None,
                        exhausted: false,
                    },
                    yielded: 0,
                })
            }
        }
    }

    /// Total fijado al abrir; no se recalcula.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Siguiente lote (vacío = fin). Nunca entrega más de `total` ids, aunque
    /// el registro crezca mientras corre la difusión.
    pub async fn next_batch(&mut self, size: usize) -> Result<Vec<RecipientId>> {
        let remaining = self.total.saturating_sub(self.yielded);
        let want = (size as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(Vec::new());
        }

        let batch = match &mut self.cursor {
            Cursor::Explicit(iter) => iter.by_ref().take(want).collect::<Vec<_>>(),
            Cursor::Registry {
                service,
                after,
                exhausted,
            } => {
                if *exhausted {
                    Vec::new()
                } else {
                    let page = service.fetch_page(*after, want).await?;
                    if page.len() < want {
                        *exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        *after = Some(*last);
                    }
                    page
                }
            }
        };

        self.yielded += batch.len() as u64;
        Ok(batch)
    }
}
