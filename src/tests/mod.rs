//! tests/mod.rs
//! Pruebas del servicio de difusión.

mod common;

mod broadcast_service_tests;
