//! Routing Test Utilities
//!
//! A scripted [`InstanceInvoker`] for exercising resolution without real
//! providers.
//!
//! ```ignore
//! let invoker = MockInvoker::failing(["gpt-4"])
//!     .with_behavior("slow-model", MockBehavior::Hang);
//!
//! resolver.resolve(&route, &RequestContext::new(), &invoker).await;
//! assert_eq!(invoker.calls(), vec!["gpt-4", "gpt-3.5"]);
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::resolver::{InstanceInvoker, InvocationError, RequestContext};

/// How a mock instance responds
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockBehavior {
    /// Respond immediately
    Succeed,
    /// Fail immediately
    Fail,
    /// Never respond
    Hang,
    /// Respond after a delay
    Delay(Duration),
}

/// Invoker with per-model scripted behavior and call history.
///
/// Models without a script succeed.
#[derive(Debug, Default)]
pub struct MockInvoker {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    calls: Mutex<Vec<String>>,
}

impl MockInvoker {
    /// Every model succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// The listed models fail, everything else succeeds
    pub fn failing<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let invoker = Self::new();
        for model in models {
            invoker.set_behavior(model, MockBehavior::Fail);
        }
        invoker
    }

    /// Script `model`
    pub fn with_behavior(self, model: impl Into<String>, behavior: MockBehavior) -> Self {
        self.set_behavior(model, behavior);
        self
    }

    /// Change the script of `model` mid-test
    pub fn set_behavior(&self, model: impl Into<String>, behavior: MockBehavior) {
        self.behaviors.lock().unwrap().insert(model.into(), behavior);
    }

    /// Models invoked so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations of `model`
    pub fn call_count(&self, model: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|m| *m == model).count()
    }
}

#[async_trait]
impl InstanceInvoker for MockInvoker {
    type Output = String;

    async fn invoke(
        &self,
        model_name: &str,
        _ctx: &RequestContext,
    ) -> Result<String, InvocationError> {
        self.calls.lock().unwrap().push(model_name.to_string());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(model_name)
            .cloned()
            .unwrap_or(MockBehavior::Succeed);

        match behavior {
            MockBehavior::Succeed => Ok(format!("response from {model_name}")),
            MockBehavior::Fail => Err(InvocationError::Status {
                status: 503,
                message: format!("{model_name} unavailable"),
            }),
            MockBehavior::Hang => std::future::pending().await,
            MockBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(format!("response from {model_name}"))
            }
        }
    }
}
