//! Fan-out of decoded events to registered listeners.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::protocol::{EventKind, ServerEvent};
use crate::error::ListenerError;

/// Registration key: a known event kind, or a raw name for events outside
/// the known set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Kind(EventKind),
    Name(String),
}

impl Route {
    pub fn of(event: &ServerEvent) -> Self {
        match event.kind() {
            Some(kind) => Self::Kind(kind),
            None => Self::Name(event.name().to_string()),
        }
    }
}

impl From<EventKind> for Route {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

impl From<&str> for Route {
    fn from(name: &str) -> Self {
        match EventKind::from_name(name) {
            Some(kind) => Self::Kind(kind),
            None => Self::Name(name.to_string()),
        }
    }
}

/// Something that reacts to streamed events.
pub trait Listener: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    fn on_event(&self, event: &ServerEvent) -> Result<(), ListenerError>;
}

/// Adapts a closure into a [`Listener`].
pub struct FnListener<F> {
    name: &'static str,
    f: F,
}

impl<F> Listener for FnListener<F>
where
    F: Fn(&ServerEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_event(&self, event: &ServerEvent) -> Result<(), ListenerError> {
        (self.f)(event)
    }
}

/// Wrap `f` as a shareable listener. Each call yields a distinct identity.
pub fn listener_fn<F>(name: &'static str, f: F) -> Arc<dyn Listener>
where
    F: Fn(&ServerEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    Arc::new(FnListener { name, f })
}

fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ordered listener sets per route, with duplicates suppressed by identity.
#[derive(Default)]
pub struct EventDispatcher {
    routes: HashMap<Route, Vec<Arc<dyn Listener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` under `route`. Returns `false` if that exact listener
    /// was already registered there.
    pub fn register(&mut self, route: impl Into<Route>, listener: Arc<dyn Listener>) -> bool {
        let route = route.into();
        let listeners = self.routes.entry(route.clone()).or_default();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            trace!(?route, listener = listener.name(), "listener already registered");
            return false;
        }
        debug!(?route, listener = listener.name(), "listener registered");
        listeners.push(listener);
        true
    }

    /// Remove `listener` from `route`. Returns `false` if it was not there.
    pub fn unregister(&mut self, route: impl Into<Route>, listener: &Arc<dyn Listener>) -> bool {
        let route = route.into();
        let Some(listeners) = self.routes.get_mut(&route) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.routes.remove(&route);
        }
        removed
    }

    /// Drop every listener for one route, or for all routes when `None`.
    pub fn clear(&mut self, route: Option<Route>) {
        match route {
            Some(route) => {
                self.routes.remove(&route);
            }
            None => self.routes.clear(),
        }
    }

    pub fn listener_count(&self, route: impl Into<Route>) -> usize {
        self.routes.get(&route.into()).map_or(0, Vec::len)
    }

    /// Invoke every listener for the event's route in registration order.
    ///
    /// The first listener error stops the fan-out and is returned; listeners
    /// after it do not see the event. Returns how many listeners ran.
    pub fn dispatch(&self, event: &ServerEvent) -> Result<usize, ListenerError> {
        let route = Route::of(event);
        let Some(listeners) = self.routes.get(&route) else {
            trace!(event = %event.name(), "no listeners");
            return Ok(0);
        };
        for listener in listeners {
            listener.on_event(event)?;
        }
        Ok(listeners.len())
    }
}
