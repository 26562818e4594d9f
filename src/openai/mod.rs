pub mod http_service;
pub mod models;
pub mod sse;
