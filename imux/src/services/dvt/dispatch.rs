//! Routing of device-initiated messages
//!
//! The device calls methods on the host as well as answering ours. Each channel can carry
//! a [`Dispatcher`] mapping selectors to handlers; a handler may return a value that is
//! sent back as the response.

use std::{collections::HashMap, fmt};

use plist::Value;
use tracing::debug;

use super::message::Message;

pub type Handler = Box<dyn Fn(&Message) -> Option<Value> + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    fallback: Option<Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles invocations of `selector`
    pub fn on(
        mut self,
        selector: impl Into<String>,
        handler: impl Fn(&Message) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(selector.into(), Box::new(handler));
        self
    }

    /// Handles every message no selector matched
    pub fn with_default(
        mut self,
        handler: impl Fn(&Message) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(handler));
        self
    }

    /// Runs the matching handler, returning its reply value
    pub fn dispatch(&self, msg: &Message) -> Option<Value> {
        let handler = msg
            .selector()
            .and_then(|s| self.handlers.get(s))
            .or(self.fallback.as_ref());
        match handler {
            Some(h) => h(msg),
            None => {
                debug!(
                    "No handler for {:?} on channel {}",
                    msg.selector(),
                    msg.message_header.channel
                );
                None
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("selectors", &self.handlers.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dvt::message::{MessageHeader, PayloadHeader};

    fn call(selector: &str) -> Message {
        Message::new(
            MessageHeader::new(0, 1, 1, 0, 1, true),
            PayloadHeader::method_invocation(),
            None,
            Some(Value::String(selector.into())),
        )
    }

    #[test]
    fn test_selector_then_fallback() {
        let d = Dispatcher::new()
            .on("ping", |_| Some(Value::String("pong".into())))
            .with_default(|_| Some(Value::Boolean(false)));
        assert_eq!(d.dispatch(&call("ping")), Some(Value::String("pong".into())));
        assert_eq!(d.dispatch(&call("other")), Some(Value::Boolean(false)));
        assert_eq!(Dispatcher::new().dispatch(&call("ping")), None);
    }
}
