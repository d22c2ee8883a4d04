//! tests/common.rs
//! Helpers compartidos: pools de prueba, fixtures y un canal falso.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio_util::sync::CancellationToken;

use crate::config::dispatch_config::DispatchConfig;
use crate::models::broadcast_model::{ActionButton, BroadcastContent};
use crate::models::db_timestamp;
use crate::models::delivery_model::DeliveryOutcome;
use crate::models::recipient_model::RecipientId;
use crate::services::broadcast_service::BroadcastService;
use crate::services::delivery_channel::DeliveryChannel;

/// SQLite en memoria con migraciones (una sola conexión)
pub async fn create_test_pool() -> Pool<Sqlite> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("Failed to create test pool");

    BroadcastService::new(pool.clone())
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    pool
}

/// SQLite en archivo (varias conexiones reales, para carreras)
pub async fn create_file_pool(dir: &Path) -> Pool<Sqlite> {
    let options = SqliteConnectOptions::new()
        .filename(dir.join("broadcasts.db"))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .expect("Failed to create file pool");

    BroadcastService::new(pool.clone())
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    pool
}

/// Config rápida para tests: sin pausas y con tasa alta.
pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        credential: "test-token".to_string(),
        rate_limit: 10_000,
        batch_size: 2,
        max_concurrency: 2,
        idle_poll_interval: Duration::from_millis(20),
        throttle_interval: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
        checkpoint_retries: 0,
        ..DispatchConfig::default()
    }
}

pub struct BroadcastFixture {
    pub message: String,
    pub message_type: &'static str,
    pub file_id: Option<String>,
    pub buttons: Vec<ActionButton>,
    pub recipients: Option<Vec<RecipientId>>,
    pub created_at: DateTime<Utc>,
}

impl Default for BroadcastFixture {
    fn default() -> Self {
        BroadcastFixture {
            message: "Hola a todos".to_string(),
            message_type: "text",
            file_id: None,
            buttons: vec![],
            recipients: None,
            created_at: Utc::now(),
        }
    }
}

/// Inserta una difusión "pending" como lo haría la capa CRUD
pub async fn insert_broadcast(pool: &Pool<Sqlite>, fixture: BroadcastFixture) -> i64 {
    let buttons = serde_json::to_string(&fixture.buttons).expect("buttons json");
    let recipients = fixture
        .recipients
        .as_ref()
        .map(|ids| serde_json::to_string(ids).expect("recipients json"));

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO broadcasts (message, message_type, file_id, buttons, recipients, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
        RETURNING id
        "#,
    )
    .bind(&fixture.message)
    .bind(fixture.message_type)
    .bind(&fixture.file_id)
    .bind(buttons)
    .bind(recipients)
    .bind(db_timestamp(fixture.created_at))
    .fetch_one(pool)
    .await
    .expect("Failed to insert broadcast");
    id
}

pub async fn insert_recipients(pool: &Pool<Sqlite>, ids: &[RecipientId], blocked: bool) {
    for id in ids {
        sqlx::query("INSERT INTO recipients (telegram_id, blocked) VALUES (?1, ?2)")
            .bind(*id)
            .bind(blocked)
            .execute(pool)
            .await
            .expect("Failed to insert recipient");
    }
}

pub fn text_content(message: &str) -> BroadcastContent {
    BroadcastContent {
        message: message.to_string(),
        kind: crate::models::broadcast_model::MessageKind::Text,
        file_id: None,
        buttons: vec![],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Start(RecipientId),
    End(RecipientId),
}

/// Canal falso: falla o entra en pánico para ids concretos y registra el
/// orden de inicio/fin de cada envío.
#[derive(Default)]
pub struct ScriptedChannel {
    pub fail: HashSet<RecipientId>,
    pub panic_on: HashSet<RecipientId>,
    pub delay: Duration,
    pub cancel_on: Option<(RecipientId, CancellationToken)>,
    pub events: Mutex<Vec<ChannelEvent>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedChannel {
    pub fn failing(ids: &[RecipientId]) -> Self {
        ScriptedChannel {
            fail: ids.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn sent_to(&self) -> Vec<RecipientId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Start(id) => Some(id),
                ChannelEvent::End(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    async fn send(&self, recipient: RecipientId, _content: &BroadcastContent) -> DeliveryOutcome {
        self.events
            .lock()
            .expect("events lock")
            .push(ChannelEvent::Start(recipient));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events
            .lock()
            .expect("events lock")
            .push(ChannelEvent::End(recipient));

        if let Some((id, token)) = &self.cancel_on {
            if *id == recipient {
                token.cancel();
            }
        }
        if self.panic_on.contains(&recipient) {
            panic!("envío simulado con pánico para {}", recipient);
        }
        if self.fail.contains(&recipient) {
            DeliveryOutcome::failed("rechazado por el canal falso")
        } else {
            DeliveryOutcome::Sent
        }
    }
}
