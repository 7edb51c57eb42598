use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{HandlerId, PostSuccessAction},
    protocol::SubmissionResult,
};
use tracing::debug;

use crate::{
    error::{ConsoleError, ConsoleResult},
    host::PageHost,
};

pub trait SuccessHandler: Send + Sync {
    fn handle(&self, result: &SubmissionResult, page: &dyn PageHost);
}

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<HandlerId, Arc<dyn SuccessHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `id`, replacing any previous one.
    pub fn register(&mut self, id: HandlerId, handler: Arc<dyn SuccessHandler>) {
        self.handlers.insert(id, handler);
    }

    pub fn contains(&self, id: &HandlerId) -> bool {
        self.handlers.contains_key(id)
    }

    /// Runs `action` for a successful result. A plain reload defers to the
    /// server's redirect target when one was given.
    pub fn run(
        &self,
        action: &PostSuccessAction,
        result: &SubmissionResult,
        page: &dyn PageHost,
    ) -> ConsoleResult<()> {
        match action {
            PostSuccessAction::Reload => match result.redirect_target.as_deref() {
                Some(target) => {
                    debug!("actions: redirect target={target}");
                    page.navigate(target);
                }
                None => page.reload(),
            },
            PostSuccessAction::NavigateTo(url) => page.navigate(url),
            PostSuccessAction::Custom(id) => {
                let handler = self
                    .handlers
                    .get(id)
                    .ok_or_else(|| ConsoleError::UnknownHandler(id.to_string()))?;
                debug!("actions: dispatch handler={id}");
                handler.handle(result, page);
            }
        }
        Ok(())
    }
}
