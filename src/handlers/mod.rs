//! handlers/mod.rs
//! Módulo que agrupa los handlers HTTP (solo consulta de progreso).
pub mod broadcast_handler;
