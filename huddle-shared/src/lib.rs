#![cfg_attr(not(test), forbid(unsafe_code))]

//! Wire models and configuration shared by the huddle server and its clients.

pub mod config;
pub mod models;
