use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::recipient_model::RecipientId;

/// Ciclo de vida: "pending" -> "inprogress" -> "completed". No hay estado "failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Pending,
    InProgress,
    Completed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Pending => "pending",
            BroadcastStatus::InProgress => "inprogress",
            BroadcastStatus::Completed => "completed",
        }
    }
}

impl FromStr for BroadcastStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BroadcastStatus::Pending),
            "inprogress" => Ok(BroadcastStatus::InProgress),
            "completed" => Ok(BroadcastStatus::Completed),
            other => Err(anyhow!("Estado de difusión desconocido: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
        }
    }
}

impl FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "video" => Ok(MessageKind::Video),
            other => Err(anyhow!("Tipo de mensaje desconocido: {}", other)),
        }
    }
}

/// Botón en línea. `web_app = true` abre una web app, si no es un enlace normal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub text: String,
    pub url: String,
    #[serde(default)]
    pub web_app: bool,
}

/// Lo que se envía a cada destinatario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastContent {
    pub message: String,
    pub kind: MessageKind,
    pub file_id: Option<String>, // obligatorio si kind != text
    pub buttons: Vec<ActionButton>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    pub id: i64,
    pub content: BroadcastContent,
    /// Lista explícita de destinatarios; `None` = todos los registrados.
    pub recipients: Option<Vec<RecipientId>>,
    pub status: BroadcastStatus,
    /// Ejecución dueña de la difusión mientras está "inprogress".
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_target: u64,
    pub total_successful: u64,
    pub total_failed: u64,
}

/// Fila tal cual sale de SQLite.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BroadcastRow {
    pub id: i64,
    pub message: String,
    pub message_type: String,
    pub file_id: Option<String>,
    pub buttons: String,
    pub recipients: Option<String>,
    pub status: String,
    pub run_id: Option<String>,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub heartbeat_at: Option<String>,
    pub completed_at: Option<String>,
    pub total_target: i64,
    pub total_successful: i64,
    pub total_failed: i64,
}

impl TryFrom<BroadcastRow> for Broadcast {
    type Error = anyhow::Error;

    fn try_from(row: BroadcastRow) -> Result<Self> {
        let buttons: Vec<ActionButton> = serde_json::from_str(&row.buttons)
            .with_context(|| format!("Botones inválidos en broadcast {}", row.id))?;

        // Una lista vacía equivale a "todos los destinatarios"
        let recipients = match row.recipients.as_deref() {
            None => None,
            Some(raw) => {
                let ids: Option<Vec<RecipientId>> = serde_json::from_str(raw)
                    .with_context(|| format!("Lista de destinatarios inválida en broadcast {}", row.id))?;
                ids.filter(|ids| !ids.is_empty())
            }
        };

        Ok(Broadcast {
            id: row.id,
            content: BroadcastContent {
                message: row.message,
                kind: row.message_type.parse()?,
                file_id: row.file_id.filter(|f| !f.is_empty()),
                buttons,
            },
            recipients,
            status: row.status.parse()?,
            run_id: row.run_id,
            created_at: row
                .created_at
                .parse::<DateTime<Utc>>()
                .context("created_at inválido")?,
            claimed_at: parse_optional(row.claimed_at)?,
            heartbeat_at: parse_optional(row.heartbeat_at)?,
            completed_at: parse_optional(row.completed_at)?,
            total_target: row.total_target.max(0) as u64,
            total_successful: row.total_successful.max(0) as u64,
            total_failed: row.total_failed.max(0) as u64,
        })
    }
}

fn parse_optional(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| v.parse::<DateTime<Utc>>().context("Timestamp inválido"))
        .transpose()
}

/// Respuesta de progreso para la API de solo lectura
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastProgressResponse {
    pub id: i64,
    pub status: BroadcastStatus,
    pub message_type: MessageKind,
    pub explicit_recipients: bool,
    pub total_target: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    /// Filas de bitácora aún "pending" (lote en vuelo o ejecución interrumpida)
    pub in_flight: u64,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BroadcastProgressResponse {
    pub fn new(b: &Broadcast, in_flight: u64) -> Self {
        BroadcastProgressResponse {
            id: b.id,
            status: b.status,
            message_type: b.content.kind,
            explicit_recipients: b.recipients.is_some(),
            total_target: b.total_target,
            total_successful: b.total_successful,
            total_failed: b.total_failed,
            in_flight,
            created_at: b.created_at,
            claimed_at: b.claimed_at,
            completed_at: b.completed_at,
        }
    }
}
