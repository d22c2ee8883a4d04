//! services/delivery_channel.rs
//! Envío de un mensaje a un destinatario a través del transporte externo.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::{
    config::dispatch_config::DispatchConfig,
    models::{
        broadcast_model::{ActionButton, BroadcastContent, MessageKind},
        delivery_model::DeliveryOutcome,
        recipient_model::RecipientId,
    },
};

/// Canal de entrega. `send` nunca falla: cualquier error se reporta como
/// `DeliveryOutcome::Failed`. No reintenta.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, recipient: RecipientId, content: &BroadcastContent) -> DeliveryOutcome;
}

/// Canal sobre la Bot API de Telegram (sendMessage / sendPhoto / sendVideo).
#[derive(Clone, Debug)]
pub struct TelegramChannel {
    http_client: Client,
    api_url: String,
}

impl TelegramChannel {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| anyhow!("No se pudo crear el cliente HTTP: {}", e))?;

        Ok(Self {
            http_client,
            api_url: format!("{}/bot{}", config.api_base_url, config.credential),
        })
    }

    async fn post(&self, method: &str, payload: &Value) -> Result<()> {
        let url = format!("{}/{}", self.api_url, method);
        // La URL lleva el token: nunca debe llegar a logs ni a la bitácora
        let resp = self
            .http_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;

        let status = resp.status();
        if !status.is_success() {
            let body_txt = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{} respondió {}: {}", method, status, body_txt));
        }

        // Solo cuenta como enviado si el API lo confirma con "ok": true
        let json_val = resp
            .json::<Value>()
            .await
            .map_err(reqwest::Error::without_url)?;
        let acknowledged = json_val.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !acknowledged {
            return Err(anyhow!("{} sin confirmación: {}", method, json_val));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send(&self, recipient: RecipientId, content: &BroadcastContent) -> DeliveryOutcome {
        let (method, payload) = match build_request(recipient, content) {
            Ok(req) => req,
            Err(e) => {
                log::warn!("(TelegramChannel::send) payload inválido para {}: {}", recipient, e);
                return DeliveryOutcome::failed(e.to_string());
            }
        };

        match self.post(method, &payload).await {
            Ok(()) => DeliveryOutcome::Sent,
            Err(e) => {
                log::debug!("(TelegramChannel::send) fallo para chat_id={}: {:?}", recipient, e);
                DeliveryOutcome::failed(format!("{:#}", e))
            }
        }
    }
}

/// Arma el método del API y el cuerpo JSON según el tipo de mensaje.
pub fn build_request(
    recipient: RecipientId,
    content: &BroadcastContent,
) -> Result<(&'static str, Value)> {
    let mut payload = json!({ "chat_id": recipient });

    let method = match content.kind {
        MessageKind::Text => {
            payload["text"] = json!(content.message);
            "sendMessage"
        }
        MessageKind::Image | MessageKind::Video => {
            let file_id = content
                .file_id
                .as_deref()
                .ok_or_else(|| anyhow!("Falta file_id para mensaje de tipo {}", content.kind.as_str()))?;
            let (method, field) = match content.kind {
                MessageKind::Image => ("sendPhoto", "photo"),
                _ => ("sendVideo", "video"),
            };
            payload[field] = json!(file_id);
            payload["caption"] = json!(content.message);
            method
        }
    };

    if !content.buttons.is_empty() {
        payload["reply_markup"] = json!({ "inline_keyboard": inline_keyboard(&content.buttons) });
    }

    Ok((method, payload))
}

/// Una fila por botón.
fn inline_keyboard(buttons: &[ActionButton]) -> Vec<Vec<Value>> {
    buttons
        .iter()
        .map(|btn| {
            if btn.web_app {
                vec![json!({ "text": btn.text, "web_app": { "url": btn.url } })]
            } else {
                vec![json!({ "text": btn.text, "url": btn.url })]
            }
        })
        .collect()
}
