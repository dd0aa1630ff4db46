//! Shared application state handed to every handler.

use std::sync::Arc;

use vmfleet_vbox::{Fleet, VboxContext};

use crate::declaration::ValidDeclaration;

/// Provider context shared across requests.
///
/// Cloning is cheap; every clone points at the same port registry and
/// network lock.
#[derive(Debug, Clone)]
pub struct AppState {
    ctx: Arc<VboxContext>,
}

impl AppState {
    #[must_use]
    pub fn new(ctx: Arc<VboxContext>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<VboxContext> {
        &self.ctx
    }

    /// Bind a validated declaration to the provider.
    #[must_use]
    pub fn fleet(&self, declaration: ValidDeclaration) -> Fleet {
        Fleet::new(
            Arc::clone(&self.ctx),
            declaration.environment,
            declaration.hosts,
            declaration.volumes,
        )
    }
}
