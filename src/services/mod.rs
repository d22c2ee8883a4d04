//! services/mod.rs
//! Módulo que agrupa distintos "servicios" o "capas de negocio" de la app.

pub mod batch_dispatcher;
pub mod broadcast_service;
pub mod delivery_channel;
pub mod delivery_service;
pub mod dispatch_service;
pub mod progress_tracker;
pub mod recipient_service;
pub mod recipient_source;
