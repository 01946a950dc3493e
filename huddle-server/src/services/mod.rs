/// Permission resolution, audience expansion and unread maintenance
pub mod audience;
pub mod engine;
pub mod error;
pub mod event_publisher;
pub mod grant_service;
pub mod membership;
pub mod permission_resolver;
pub mod reconciler;
pub mod retry;
pub mod unread_propagator;

pub use engine::{ChatEngine, EngineDeps};
pub use error::{EngineError, EngineResult};
