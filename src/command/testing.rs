//! Scripted [`CommandRunner`] for unit tests.

use super::{CommandOutput, CommandRequest, CommandRunner, CommandStream};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

type Responder = dyn Fn(&CommandRequest) -> Result<CommandOutput> + Send + Sync;

/// Records every request and answers through a closure.
#[derive(Clone)]
pub(crate) struct FakeRunner {
    calls: Arc<Mutex<Vec<CommandRequest>>>,
    respond: Arc<Responder>,
}

impl FakeRunner {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: Fn(&CommandRequest) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            respond: Arc::new(respond),
        }
    }

    /// Every command succeeds with empty output.
    pub(crate) fn succeeding() -> Self {
        Self::new(|_| Ok(CommandOutput::ok("")))
    }

    pub(crate) fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(request.clone());
        (self.respond)(&request)
    }

    async fn stream(&self, request: CommandRequest) -> Result<CommandStream> {
        self.calls.lock().unwrap().push(request.clone());
        Err(AtelierError::Command(format!(
            "streaming not scripted: {}",
            request.display()
        )))
    }
}
