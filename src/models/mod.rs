//! models/mod.rs
//! Módulo raíz para modelos/estructuras compartidas.

use chrono::{DateTime, SecondsFormat, Utc};

pub mod broadcast_model;
pub mod delivery_model;
pub mod recipient_model;

/// Formato de fecha que guardamos en SQLite (ancho fijo, ordenable como texto).
pub fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
