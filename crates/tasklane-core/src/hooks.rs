//! Post-commit hooks.
//!
//! Side effects that must only happen once a transaction is durable (limiter
//! metering, event publication) are queued here and run after commit, each on
//! its own tokio task so a panicking hook cannot take the caller down.

use tokio::task::JoinHandle;

type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub struct PostCommitHooks {
    hooks: Vec<(&'static str, Hook)>,
}

impl PostCommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push((name, Box::new(hook)));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Spawn every hook. The returned handle resolves to the number of hooks
    /// that panicked; callers may ignore it.
    pub fn run(self) -> JoinHandle<usize> {
        let handles: Vec<_> = self
            .hooks
            .into_iter()
            .map(|(name, hook)| (name, tokio::spawn(async move { hook() })))
            .collect();

        tokio::spawn(async move {
            let mut panicked = 0;
            for (name, handle) in handles {
                match handle.await {
                    Ok(()) => {}
                    Err(err) if err.is_panic() => {
                        panicked += 1;
                        tracing::error!(hook = name, "post-commit hook panicked");
                    }
                    Err(err) => {
                        tracing::warn!(hook = name, error = %err, "post-commit hook did not finish");
                    }
                }
            }
            panicked
        })
    }
}

impl std::fmt::Debug for PostCommitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.hooks.iter().map(|(name, _)| *name).collect();
        f.debug_struct("PostCommitHooks").field("hooks", &names).finish()
    }
}
