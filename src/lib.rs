//! Answer relay
//!
//! Takes a stored question image through OCR, asks every configured LLM
//! backend for an answer concurrently, persists one answer per backend and
//! pushes progress to websocket rooms as it happens.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
