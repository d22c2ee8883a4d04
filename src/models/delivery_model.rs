use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::recipient_model::RecipientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(anyhow!("Estado de entrega desconocido: {}", other)),
        }
    }
}

/// Resultado de un único envío. Nunca es un error: los fallos se cuentan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed { reason: String },
}

impl DeliveryOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        DeliveryOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent)
    }
}

/// Entrada de la bitácora por destinatario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub broadcast_id: i64,
    pub recipient_id: RecipientId,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryRecordRow {
    pub id: String,
    pub broadcast_id: i64,
    pub recipient_id: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub sent_at: Option<String>,
}

impl TryFrom<DeliveryRecordRow> for DeliveryRecord {
    type Error = anyhow::Error;

    fn try_from(row: DeliveryRecordRow) -> Result<Self> {
        Ok(DeliveryRecord {
            id: row.id,
            broadcast_id: row.broadcast_id,
            recipient_id: row.recipient_id,
            status: row.status.parse()?,
            error_message: row.error_message,
            created_at: row.created_at.parse()?,
            sent_at: row.sent_at.map(|s| s.parse()).transpose()?,
        })
    }
}

/// Para listar la bitácora con paginación
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDeliveriesResponse {
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub items: Vec<DeliveryRecord>,
}
