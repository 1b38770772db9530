//! Composes multiple controllers with ordered startup and reverse-order
//! shutdown.

use crate::{Controller, Result};
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct ControllerManager {
    controllers: Vec<Arc<Controller>>,
}

impl ControllerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, controller: Arc<Controller>) {
        self.controllers.push(controller);
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Starts every controller in order, returning early on the first
    /// failure.
    pub async fn start(&self) -> Result<()> {
        for controller in &self.controllers {
            info!(controller = controller.name(), "starting controller");
            controller.start().await?;
        }
        Ok(())
    }

    /// Stops all controllers in reverse order.
    pub async fn stop(&self) {
        for controller in self.controllers.iter().rev() {
            info!(controller = controller.name(), "stopping controller");
            controller.stop().await;
        }
    }
}
