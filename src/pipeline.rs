// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Behavior Pipeline
//!
//! Ordered chain of behaviors wrapped around a terminal action: the actual
//! publish on the publish side, the actual handler on the handle side.
//!
//! A pipeline is composed once per publish target or subscription from the
//! configured behavior names. The first configured behavior is the outermost
//! wrapper and the terminal action the innermost, so `[A, B]` runs as
//! `A-before, B-before, terminal, B-after, A-after`.
//!
//! Each behavior gets the rest of the chain as a [`Next`] it consumes with
//! [`Next::run`]. Since `run` takes `self`, the rest of the chain runs at most
//! once; not calling it short-circuits the pipeline.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

/// Name of the built-in logging behaviors.
pub const LOGGING_BEHAVIOR: &str = "logging";
/// Name of the built-in metrics behaviors.
pub const METRICS_BEHAVIOR: &str = "metrics";

/// Cross-cutting logic around a publish (`C = PublishMessageContext`) or a
/// handle (`C = SubscribeMessageContext`).
#[async_trait]
pub trait Behavior<C, E>: Send + Sync {
    /// Name the behavior is attached by in the configuration.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &C, next: Next<'_, C, E>) -> Result<(), E>;
}

type Terminal<'a, E> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), E>> + Send + 'a>;

/// The rest of the chain.
pub struct Next<'a, C, E> {
    behaviors: &'a [Arc<dyn Behavior<C, E>>],
    ctx: &'a C,
    terminal: Terminal<'a, E>,
}

impl<'a, C, E> Next<'a, C, E>
where
    C: Send + Sync + 'static,
    E: Send + 'static,
{
    /// Runs the remaining behaviors and the terminal action.
    pub fn run(self) -> BoxFuture<'a, Result<(), E>> {
        let Next {
            behaviors,
            ctx,
            terminal,
        } = self;

        match behaviors.split_first() {
            Some((first, rest)) => first.handle(
                ctx,
                Next {
                    behaviors: rest,
                    ctx,
                    terminal,
                },
            ),
            None => terminal(),
        }
    }
}

/// Behaviors available to pipelines, by name.
pub struct BehaviorRegistry<C, E> {
    behaviors: HashMap<String, Arc<dyn Behavior<C, E>>>,
}

impl<C, E> Default for BehaviorRegistry<C, E> {
    fn default() -> Self {
        Self {
            behaviors: HashMap::default(),
        }
    }
}

impl<C, E> BehaviorRegistry<C, E>
where
    C: Send + Sync + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a behavior under its name, replacing a previous one.
    pub fn register(&mut self, behavior: Arc<dyn Behavior<C, E>>) -> &mut Self {
        self.behaviors
            .insert(behavior.name().trim().to_lowercase(), behavior);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Behavior<C, E>>> {
        self.behaviors.get(&name.trim().to_lowercase()).cloned()
    }
}

/// Behaviors composed for one target, outermost first.
pub struct Pipeline<C, E> {
    behaviors: Vec<Arc<dyn Behavior<C, E>>>,
}

impl<C, E> Pipeline<C, E>
where
    C: Send + Sync + 'static,
    E: Send + 'static,
{
    pub fn new(behaviors: Vec<Arc<dyn Behavior<C, E>>>) -> Self {
        Self { behaviors }
    }

    /// Resolves the configured names against the registry.
    ///
    /// Names without a registered behavior are skipped with a warning.
    pub fn compose(names: &[String], registry: &BehaviorRegistry<C, E>) -> Self {
        let behaviors = names
            .iter()
            .filter_map(|name| {
                let behavior = registry.get(name);
                if behavior.is_none() {
                    warn!(behavior = name, "behavior is not registered, skipping it");
                }
                behavior
            })
            .collect();

        Self { behaviors }
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    /// Runs the behaviors around `terminal`.
    pub async fn execute<'a, F>(&'a self, ctx: &'a C, terminal: F) -> Result<(), E>
    where
        F: FnOnce() -> BoxFuture<'a, Result<(), E>> + Send + 'a,
    {
        Next {
            behaviors: self.behaviors.as_slice(),
            ctx,
            terminal: Box::new(terminal),
        }
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Behavior<(), String> for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _ctx: &(), next: Next<'_, (), String>) -> Result<(), String> {
            self.log.lock().unwrap().push(format!("{}-before", self.name));
            if self.short_circuit {
                return Ok(());
            }
            let result = next.run().await;
            let outcome = if result.is_ok() { "after" } else { "unwind" };
            self.log
                .lock()
                .unwrap()
                .push(format!("{}-{}", self.name, outcome));
            result
        }
    }

    fn registry(log: &Arc<Mutex<Vec<String>>>, short_circuit_b: bool) -> BehaviorRegistry<(), String> {
        let mut registry = BehaviorRegistry::new();
        registry.register(Arc::new(Recording {
            name: "A",
            log: log.clone(),
            short_circuit: false,
        }));
        registry.register(Arc::new(Recording {
            name: "B",
            log: log.clone(),
            short_circuit: short_circuit_b,
        }));
        registry
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn first_behavior_is_outermost() {
        let log = Arc::new(Mutex::new(vec![]));
        let pipeline = Pipeline::compose(&names(&["a", "b"]), &registry(&log, false));

        let terminal_log = log.clone();
        pipeline
            .execute(&(), move || {
                Box::pin(async move {
                    terminal_log.lock().unwrap().push("terminal".to_owned());
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-before", "B-before", "terminal", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn errors_unwind_through_every_open_frame() {
        let log = Arc::new(Mutex::new(vec![]));
        let pipeline = Pipeline::compose(&names(&["A", "B"]), &registry(&log, false));

        let result = pipeline
            .execute(&(), || Box::pin(async { Err("boom".to_owned()) }))
            .await;

        assert_eq!(result, Err("boom".to_owned()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-before", "B-before", "B-unwind", "A-unwind"]
        );
    }

    #[tokio::test]
    async fn behavior_can_short_circuit() {
        let log = Arc::new(Mutex::new(vec![]));
        let pipeline = Pipeline::compose(&names(&["A", "B"]), &registry(&log, true));

        let terminal_log = log.clone();
        pipeline
            .execute(&(), move || {
                Box::pin(async move {
                    terminal_log.lock().unwrap().push("terminal".to_owned());
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["A-before", "B-before", "A-after"]);
    }

    #[tokio::test]
    async fn unknown_behaviors_are_skipped() {
        let log = Arc::new(Mutex::new(vec![]));
        let pipeline = Pipeline::compose(&names(&["missing", "B"]), &registry(&log, false));
        assert_eq!(pipeline.len(), 1);

        pipeline
            .execute(&(), || Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["B-before", "B-after"]);
    }
}
