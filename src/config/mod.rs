//! config/mod.rs
//! Configuración global del proceso.

pub mod dispatch_config;
