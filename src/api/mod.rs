pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::messaging::{BrokerProducer, Dispatcher, ValidationPipe};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub producer: BrokerProducer,
    pub dispatcher: Option<Dispatcher>,
    pub pipe: Arc<ValidationPipe>,
}

impl AppState {
    pub fn new(producer: BrokerProducer) -> Self {
        Self {
            producer,
            dispatcher: None,
            pipe: Arc::new(ValidationPipe::new()),
        }
    }

    /// Report consumer health alongside the producer
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }
}
