//! Caller-supplied transform hooks.
//!
//! A hook may return a replacement, veto with `Ok(None)`, fail with an
//! error, or panic. Failures and results that do not pass the shape check
//! fall back to the original; they never drop it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use crate::model::{Event, EventsBatch};

/// Error a hook may return to signal it could not transform its input.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransformError(pub String);

pub type EventTransform =
    Arc<dyn Fn(&Event) -> Result<Option<Event>, TransformError> + Send + Sync>;
pub type BatchTransform =
    Arc<dyn Fn(&EventsBatch) -> Result<Option<EventsBatch>, TransformError> + Send + Sync>;

/// Hooks run before queueing and before delivery.
#[derive(Clone, Default)]
pub struct Transforms {
    pub before_send: Option<EventTransform>,
    pub before_batch: Option<BatchTransform>,
}

impl Transforms {
    pub fn before_send<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> Result<Option<Event>, TransformError> + Send + Sync + 'static,
    {
        self.before_send = Some(Arc::new(f));
        self
    }

    pub fn before_batch<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventsBatch) -> Result<Option<EventsBatch>, TransformError> + Send + Sync + 'static,
    {
        self.before_batch = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for Transforms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transforms")
            .field("before_send", &self.before_send.is_some())
            .field("before_batch", &self.before_batch.is_some())
            .finish()
    }
}

#[derive(Debug, PartialEq)]
pub enum Outcome<T> {
    Keep(T),
    Veto,
}

pub(crate) fn apply_event(hook: Option<&EventTransform>, event: Event) -> Outcome<Event> {
    let Some(hook) = hook else {
        return Outcome::Keep(event);
    };
    apply(hook.as_ref(), event, "event", Event::is_well_formed)
}

pub(crate) fn apply_batch(hook: Option<&BatchTransform>, batch: EventsBatch) -> Outcome<EventsBatch> {
    let Some(hook) = hook else {
        return Outcome::Keep(batch);
    };
    apply(hook.as_ref(), batch, "batch", |b: &EventsBatch| {
        b.events.iter().all(Event::is_well_formed)
    })
}

fn apply<T, F, C>(hook: &F, original: T, what: &'static str, well_formed: C) -> Outcome<T>
where
    F: Fn(&T) -> Result<Option<T>, TransformError> + ?Sized,
    C: Fn(&T) -> bool,
{
    match catch_unwind(AssertUnwindSafe(|| hook(&original))) {
        Ok(Ok(Some(transformed))) if well_formed(&transformed) => Outcome::Keep(transformed),
        Ok(Ok(Some(_))) => {
            warn!(what, "transform returned a malformed value, keeping original");
            Outcome::Keep(original)
        }
        Ok(Ok(None)) => Outcome::Veto,
        Ok(Err(e)) => {
            warn!(what, error = %e, "transform failed, keeping original");
            Outcome::Keep(original)
        }
        Err(_) => {
            warn!(what, "transform panicked, keeping original");
            Outcome::Keep(original)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Payload;

    fn hooks(f: impl Fn(&Event) -> Result<Option<Event>, TransformError> + Send + Sync + 'static) -> Transforms {
        Transforms::default().before_send(f)
    }

    #[test]
    fn replacement_is_used() {
        let t = hooks(|e| Ok(Some(e.clone().at(42))));
        let out = apply_event(t.before_send.as_ref(), Event::page_view("/a").at(1));
        assert_eq!(out, Outcome::Keep(Event::page_view("/a").at(42)));
    }

    #[test]
    fn none_vetoes() {
        let t = hooks(|_| Ok(None));
        assert_eq!(apply_event(t.before_send.as_ref(), Event::page_view("/a")), Outcome::Veto);
    }

    #[test]
    fn error_panic_and_malformed_fall_back() {
        let original = Event::page_view("/a").at(1);

        let failing = hooks(|_| Err(TransformError("nope".into())));
        assert_eq!(
            apply_event(failing.before_send.as_ref(), original.clone()),
            Outcome::Keep(original.clone())
        );

        let panicking = hooks(|_| panic!("hook bug"));
        assert_eq!(
            apply_event(panicking.before_send.as_ref(), original.clone()),
            Outcome::Keep(original.clone())
        );

        // A click payload on a page-view event does not pass the shape check.
        let malformed = hooks(|e| {
            let mut e = e.clone();
            e.payload = Some(Payload::Click {
                x: 0.0,
                y: 0.0,
                element: None,
                text: None,
            });
            Ok(Some(e))
        });
        assert_eq!(
            apply_event(malformed.before_send.as_ref(), original.clone()),
            Outcome::Keep(original)
        );
    }
}
