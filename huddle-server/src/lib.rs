#![cfg_attr(not(test), forbid(unsafe_code))]

//! Huddle server: permission resolution, audience expansion and unread
//! propagation for chat groups and threads, served over axum.

pub mod app_state;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod services;
pub mod tracer;
