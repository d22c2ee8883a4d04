//! app.rs
use crate::handlers::broadcast_handler;
use actix_web::web;

pub fn init_app(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(broadcast_handler::health_endpoint))
            .service(
                web::scope("/broadcasts")
                    .route(
                        "/{id}",
                        web::get().to(broadcast_handler::get_broadcast_progress_endpoint),
                    )
                    .route(
                        "/{id}/deliveries",
                        web::get().to(broadcast_handler::list_deliveries_endpoint),
                    ),
            ),
    );
}
