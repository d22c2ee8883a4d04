//! handlers/broadcast_handler.rs
//! Consulta de progreso (solo lectura). Crear/editar difusiones no es parte
//! de este servicio.
use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::{
    models::{broadcast_model::BroadcastProgressResponse, delivery_model::DeliveryStatus},
    services::{broadcast_service::BroadcastService, delivery_service::DeliveryService},
};

#[derive(Deserialize)]
pub struct DeliveriesQuery {
    status: Option<DeliveryStatus>,
    page: Option<u64>,
    page_size: Option<u64>,
}

/// GET /api/health
pub async fn health_endpoint() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/broadcasts/{id}
pub async fn get_broadcast_progress_endpoint(
    broadcast_service: web::Data<BroadcastService>,
    delivery_service: web::Data<DeliveryService>,
    path: web::Path<i64>,
) -> HttpResponse {
    let broadcast_id = path.into_inner();

    let broadcast = match broadcast_service.get_broadcast(broadcast_id).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({
                "error": "Broadcast not found",
                "id": broadcast_id
            }))
        }
        Err(e) => {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Internal server error",
                "details": format!("{:?}", e)
            }))
        }
    };

    match delivery_service
        .count_by_status(broadcast_id, DeliveryStatus::Pending)
        .await
    {
        Ok(in_flight) => {
            HttpResponse::Ok().json(BroadcastProgressResponse::new(&broadcast, in_flight))
        }
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "Internal server error",
            "details": format!("{:?}", e)
        })),
    }
}

/// GET /api/broadcasts/{id}/deliveries
pub async fn list_deliveries_endpoint(
    broadcast_service: web::Data<BroadcastService>,
    delivery_service: web::Data<DeliveryService>,
    path: web::Path<i64>,
    query: web::Query<DeliveriesQuery>,
) -> HttpResponse {
    let broadcast_id = path.into_inner();
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50).clamp(1, 500);

    match broadcast_service.get_broadcast(broadcast_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({
                "error": "Broadcast not found",
                "id": broadcast_id
            }))
        }
        Err(e) => {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Internal server error",
                "details": format!("{:?}", e)
            }))
        }
    }

    match delivery_service
        .list_for_broadcast(broadcast_id, query.status, page, page_size)
        .await
    {
        Ok(list) => HttpResponse::Ok().json(list),
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "Internal server error",
            "details": format!("{:?}", e)
        })),
    }
}
