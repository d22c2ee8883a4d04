//! tests/broadcast_service_tests.rs
//! Reclamo atómico, checkpoints, finalize y reencolado por lease.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use actix_rt::test;
    use chrono::Utc;

    use crate::models::broadcast_model::{BroadcastStatus, MessageKind};
    use crate::models::db_timestamp;
    use crate::models::delivery_model::{DeliveryOutcome, DeliveryStatus};
    use crate::services::broadcast_service::{BroadcastService, SettledDelivery};
    use crate::services::delivery_service::DeliveryService;
    use crate::tests::common::{
        create_file_pool, create_test_pool, insert_broadcast, BroadcastFixture,
    };

    /// Reclama la siguiente difusión y devuelve el run_id de la ejecución
    async fn claim_run(service: &BroadcastService) -> String {
        let claimed = service.claim_next_pending().await.unwrap().unwrap();
        claimed.run_id.expect("un reclamo siempre trae run_id")
    }

    #[test]
    async fn test_claim_returns_none_when_nothing_pending() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool);

        assert!(service.claim_next_pending().await.unwrap().is_none());
    }

    #[test]
    async fn test_claim_is_fifo_by_creation_time() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());

        // B se inserta primero pero es más nueva
        let newer = insert_broadcast(
            &pool,
            BroadcastFixture {
                message: "B".to_string(),
                created_at: Utc::now(),
                ..Default::default()
            },
        )
        .await;
        let older = insert_broadcast(
            &pool,
            BroadcastFixture {
                message: "A".to_string(),
                created_at: Utc::now() - chrono::Duration::minutes(5),
                ..Default::default()
            },
        )
        .await;

        let first = service.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(first.id, older);
        assert_eq!(first.status, BroadcastStatus::InProgress);
        assert!(first.claimed_at.is_some());

        let second = service.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(second.id, newer);

        assert!(service.claim_next_pending().await.unwrap().is_none());
    }

    #[test]
    async fn test_claim_is_exclusive_between_concurrent_workers() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_file_pool(dir.path()).await;
        let id = insert_broadcast(&pool, BroadcastFixture::default()).await;

        let worker_a = BroadcastService::new(pool.clone());
        let worker_b = BroadcastService::new(pool.clone());

        let (a, b) = futures_util::future::join(
            worker_a.claim_next_pending(),
            worker_b.claim_next_pending(),
        )
        .await;

        let claims: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(claims.len(), 1, "exactamente un worker debe ganar");
        assert_eq!(claims[0].id, id);

        let stored = worker_a.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::InProgress);
    }

    #[test]
    async fn test_claim_parses_content() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());

        sqlx::query(
            r#"
            INSERT INTO broadcasts (message, message_type, file_id, buttons, recipients, status, created_at)
            VALUES ('Mira esto', 'video', 'vid-1',
                    '[{"text":"Abrir","url":"https://a.example"},{"text":"App","url":"https://b.example","web_app":true}]',
                    '[]', 'pending', ?1)
            "#,
        )
        .bind(db_timestamp(Utc::now()))
        .execute(&pool)
        .await
        .unwrap();

        let broadcast = service.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(broadcast.content.kind, MessageKind::Video);
        assert_eq!(broadcast.content.file_id.as_deref(), Some("vid-1"));
        assert_eq!(broadcast.content.buttons.len(), 2);
        assert!(!broadcast.content.buttons[0].web_app);
        assert!(broadcast.content.buttons[1].web_app);
        // lista vacía = todos los registrados
        assert!(broadcast.recipients.is_none());
    }

    #[test]
    async fn test_checkpoint_is_idempotent() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());
        let id = insert_broadcast(&pool, BroadcastFixture::default()).await;

        let run = claim_run(&service).await;
        service.set_total_target(id, &run, 5).await.unwrap();

        service.checkpoint(id, &run, 3, 1, &[]).await.unwrap();
        service.checkpoint(id, &run, 3, 1, &[]).await.unwrap();

        let stored = service.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.total_target, 5);
        assert_eq!(stored.total_successful, 3);
        assert_eq!(stored.total_failed, 1);
        assert_eq!(stored.status, BroadcastStatus::InProgress);
    }

    #[test]
    async fn test_checkpoint_settles_ledger_rows() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());
        let deliveries = DeliveryService::new(pool.clone());
        let id = insert_broadcast(&pool, BroadcastFixture::default()).await;

        let run = claim_run(&service).await;
        service.set_total_target(id, &run, 2).await.unwrap();
        let pending = deliveries.open_batch(id, &run, &[7, 8]).await.unwrap();
        assert_eq!(
            deliveries.count_by_status(id, DeliveryStatus::Pending).await.unwrap(),
            2
        );

        let settled = vec![
            SettledDelivery {
                delivery_id: pending[0].delivery_id.clone(),
                outcome: DeliveryOutcome::Sent,
            },
            SettledDelivery {
                delivery_id: pending[1].delivery_id.clone(),
                outcome: DeliveryOutcome::failed("Forbidden: bot was blocked by the user"),
            },
        ];
        service.checkpoint(id, &run, 1, 1, &settled).await.unwrap();

        let list = deliveries.list_for_broadcast(id, None, 1, 10).await.unwrap();
        assert_eq!(list.total, 2);
        let sent = list.items.iter().find(|d| d.recipient_id == 7).unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert!(sent.sent_at.is_some());
        let failed = list.items.iter().find(|d| d.recipient_id == 8).unwrap();
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert!(failed.sent_at.is_none());
        assert!(failed.error_message.as_deref().unwrap().contains("blocked"));
    }

    #[test]
    async fn test_finalize_completes_and_rejects_later_writes() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());
        let id = insert_broadcast(&pool, BroadcastFixture::default()).await;

        let run = claim_run(&service).await;
        service.set_total_target(id, &run, 3).await.unwrap();
        service.finalize(id, &run, 2, 1).await.unwrap();

        let stored = service.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Completed);
        assert_eq!(stored.total_successful + stored.total_failed, stored.total_target);
        assert!(stored.completed_at.is_some());

        // Ya no es de nadie: no se puede volver a tocar
        assert!(service.checkpoint(id, &run, 3, 0, &[]).await.is_err());
        assert!(service.set_total_target(id, &run, 10).await.is_err());
        assert!(service.claim_next_pending().await.unwrap().is_none());
    }

    #[test]
    async fn test_reclaim_stale_requeues_only_expired() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());
        let stale = insert_broadcast(
            &pool,
            BroadcastFixture {
                created_at: Utc::now() - chrono::Duration::minutes(10),
                ..Default::default()
            },
        )
        .await;
        let fresh = insert_broadcast(&pool, BroadcastFixture::default()).await;

        service.claim_next_pending().await.unwrap().unwrap();
        service.claim_next_pending().await.unwrap().unwrap();

        // Simulamos un worker caído hace una hora
        sqlx::query("UPDATE broadcasts SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(db_timestamp(Utc::now() - chrono::Duration::hours(1)))
            .bind(stale)
            .execute(&pool)
            .await
            .unwrap();

        let reclaimed = service
            .reclaim_stale(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let stale_row = service.get_broadcast(stale).await.unwrap().unwrap();
        assert_eq!(stale_row.status, BroadcastStatus::Pending);
        let fresh_row = service.get_broadcast(fresh).await.unwrap().unwrap();
        assert_eq!(fresh_row.status, BroadcastStatus::InProgress);
    }

    #[test]
    async fn test_reclaimed_broadcast_starts_clean() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());
        let deliveries = DeliveryService::new(pool.clone());
        let id = insert_broadcast(&pool, BroadcastFixture::default()).await;

        let run = claim_run(&service).await;
        service.set_total_target(id, &run, 4).await.unwrap();
        deliveries.open_batch(id, &run, &[1, 2]).await.unwrap();
        service.checkpoint(id, &run, 1, 1, &[]).await.unwrap();

        sqlx::query("UPDATE broadcasts SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(db_timestamp(Utc::now() - chrono::Duration::hours(1)))
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        service.reclaim_stale(Duration::from_secs(60)).await.unwrap();

        let again = service.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_ne!(again.run_id.as_deref(), Some(run.as_str()));
        assert_eq!(again.total_target, 0);
        assert_eq!(again.total_successful, 0);
        assert_eq!(again.total_failed, 0);
        assert_eq!(
            deliveries.list_for_broadcast(id, None, 1, 10).await.unwrap().total,
            0
        );
    }

    #[test]
    async fn test_stale_run_cannot_write_after_reclaim() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());
        let deliveries = DeliveryService::new(pool.clone());
        let id = insert_broadcast(&pool, BroadcastFixture::default()).await;

        // Worker A reclama y se queda sin latido
        let run_a = claim_run(&service).await;
        service.set_total_target(id, &run_a, 10).await.unwrap();
        let pending_a = deliveries.open_batch(id, &run_a, &[1, 2]).await.unwrap();
        sqlx::query("UPDATE broadcasts SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(db_timestamp(Utc::now() - chrono::Duration::hours(1)))
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();

        // Worker B la recupera y arranca de nuevo
        service.reclaim_stale(Duration::from_secs(60)).await.unwrap();
        let run_b = claim_run(&service).await;
        service.set_total_target(id, &run_b, 2).await.unwrap();

        // A despierta: ninguna de sus escrituras debe pasar
        let settled_a = vec![SettledDelivery {
            delivery_id: pending_a[0].delivery_id.clone(),
            outcome: DeliveryOutcome::Sent,
        }];
        assert!(service.checkpoint(id, &run_a, 7, 3, &settled_a).await.is_err());
        assert!(service.set_total_target(id, &run_a, 10).await.is_err());
        assert!(deliveries.open_batch(id, &run_a, &[3]).await.is_err());
        assert!(service.finalize(id, &run_a, 7, 3).await.is_err());

        let stored = service.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::InProgress);
        assert_eq!(stored.total_target, 2);
        assert_eq!(stored.total_successful, 0);
        assert_eq!(stored.total_failed, 0);
        assert!(stored.total_successful + stored.total_failed <= stored.total_target);
        assert_eq!(
            deliveries.list_for_broadcast(id, None, 1, 10).await.unwrap().total,
            0
        );

        // B sigue siendo dueña
        service.checkpoint(id, &run_b, 1, 1, &[]).await.unwrap();
        service.finalize(id, &run_b, 1, 1).await.unwrap();
        let stored = service.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Completed);
        assert_eq!(stored.total_successful + stored.total_failed, 2);
    }

    #[test]
    async fn test_unreadable_broadcast_is_closed_and_skipped() {
        let pool = create_test_pool().await;
        let service = BroadcastService::new(pool.clone());

        sqlx::query(
            r#"
            INSERT INTO broadcasts (message, message_type, buttons, status, created_at)
            VALUES ('Roto', 'text', 'no es json', 'pending', ?1)
            "#,
        )
        .bind(db_timestamp(Utc::now() - chrono::Duration::minutes(5)))
        .execute(&pool)
        .await
        .unwrap();
        // created_at con el formato por defecto de SQLite, no RFC3339
        sqlx::query(
            r#"
            INSERT INTO broadcasts (message, message_type, status, created_at)
            VALUES ('Fecha rara', 'text', 'pending', '2000-01-01 00:00:00')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        let good = insert_broadcast(&pool, BroadcastFixture::default()).await;

        let claimed = service.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.id, good);

        let (closed,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM broadcasts
            WHERE id != ?1 AND status = 'completed' AND run_id IS NULL
              AND total_target = 0 AND total_successful = 0 AND total_failed = 0
              AND completed_at IS NOT NULL
            "#,
        )
        .bind(good)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(closed, 2);
        assert!(service.claim_next_pending().await.unwrap().is_none());
    }
}
