use std::panic::{catch_unwind, AssertUnwindSafe};

/// What the fault barrier does after catching a panic. Either way the
/// panic is converted into an `Err` and the calling worker keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicStrategy {
    /// Convert silently.
    Isolate,
    /// Convert and emit an `error!` event.
    #[default]
    LogAndContinue,
}

/// Fault barrier wrapped around every task execution and worker hook.
#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self { strategy }
    }

    pub fn execute<F, R>(&self, f: F) -> Result<R, PanicInfo>
    where
        F: FnOnce() -> R,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Ok(result),
            Err(panic_payload) => {
                let panic_info = PanicInfo::from_payload(panic_payload);

                if self.strategy == PanicStrategy::LogAndContinue {
                    tracing::error!(message = %panic_info.message, "panic caught");
                }

                Err(panic_info)
            }
        }
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(PanicStrategy::default())
    }
}

#[derive(Debug, Clone)]
pub struct PanicInfo {
    pub message: String,
}

impl PanicInfo {
    fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        Self { message }
    }
}
