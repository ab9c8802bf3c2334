//! The channel registry: topic patterns to channel handlers, compiled once.
//!
//! A registry is built at handler-module definition time and immutable
//! afterwards. Routes are `(pattern, channel, options)` triples; a pattern
//! is either a literal topic or a `"prefix:*"` splat where the splat is the
//! entire trailing segment. Lookup resolves the **first match in
//! registration order**, so register more specific patterns first.
//!
//! Configuration errors (a splat anywhere but the terminal position, a
//! duplicate transport name, a malformed serializer version requirement)
//! panic at registration time, so a bad handler module fails to load rather
//! than misroute at runtime.

use crate::channel::{Channel, ChannelFactory, TypedChannelFactory};
use crate::serializer::SerializerSpec;
use crate::socket::Assigns;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Options attached to a channel route.
#[derive(Debug, Clone, Default)]
pub struct ChannelOpts {
    /// Assigns merged into the socket on join.
    pub assigns: Assigns,
}

impl ChannelOpts {
    /// Empty options.
    pub fn new() -> Self {
        ChannelOpts::default()
    }

    /// Add an assign merged into every joining socket.
    pub fn assign(mut self, key: impl Into<String>, value: Value) -> Self {
        self.assigns.insert(key.into(), value);
        self
    }
}

/// A validated topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    kind: PatternKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    Exact,
    /// Matches any topic whose byte prefix equals the stored prefix
    /// (including the trailing `:`).
    Prefix(String),
}

impl TopicPattern {
    /// Parse and validate a pattern.
    ///
    /// # Panics
    ///
    /// Panics when a `*` appears anywhere but as the entire trailing
    /// segment (`"<prefix>:*"`).
    pub fn parse(pattern: &str) -> Self {
        match pattern.find('*') {
            None => TopicPattern {
                raw: pattern.to_string(),
                kind: PatternKind::Exact,
            },
            Some(pos) if pos == pattern.len() - 1 => {
                let prefix = &pattern[..pos];
                if !prefix.ends_with(':') {
                    panic!(
                        "invalid topic pattern {:?}: the splat must be the entire \
                         trailing segment, as in \"prefix:*\"",
                        pattern
                    );
                }
                TopicPattern {
                    raw: pattern.to_string(),
                    kind: PatternKind::Prefix(prefix.to_string()),
                }
            }
            Some(_) => panic!(
                "invalid topic pattern {:?}: `*` is only allowed in the terminal position",
                pattern
            ),
        }
    }

    /// Whether a topic matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        match &self.kind {
            PatternKind::Exact => self.raw == topic,
            PatternKind::Prefix(prefix) => topic.as_bytes().starts_with(prefix.as_bytes()),
        }
    }

    /// The pattern as registered.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

struct Route {
    pattern: TopicPattern,
    factory: Arc<dyn ChannelFactory>,
    opts: ChannelOpts,
}

/// Immutable map from topic patterns to channel handlers, plus the
/// transport declarations of the handler module.
pub struct ChannelRegistry {
    routes: Vec<Route>,
    transports: HashMap<String, SerializerSpec>,
}

impl ChannelRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            routes: Vec::new(),
            transports: HashMap::new(),
        }
    }

    /// Resolve a topic to its channel handler and options.
    ///
    /// First match in registration order wins; resolution is deterministic
    /// for a given registry.
    pub fn lookup(&self, topic: &str) -> Option<(Arc<dyn ChannelFactory>, &ChannelOpts)> {
        self.routes
            .iter()
            .find(|route| route.pattern.matches(topic))
            .map(|route| (route.factory.clone(), &route.opts))
    }

    /// The serializer configuration declared for a transport.
    pub fn serializers(&self, transport: &str) -> Option<&SerializerSpec> {
        self.transports.get(transport)
    }

    /// Registered patterns, in registration order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.pattern.as_str())
    }
}

/// Builder for [`ChannelRegistry`].
pub struct RegistryBuilder {
    routes: Vec<Route>,
    transports: HashMap<String, SerializerSpec>,
}

impl RegistryBuilder {
    /// Register a channel for a topic pattern.
    ///
    /// # Panics
    ///
    /// Panics on an invalid pattern (see [`TopicPattern::parse`]).
    pub fn channel<C: Channel>(self, pattern: &str, opts: ChannelOpts) -> Self {
        self.route(pattern, Arc::new(TypedChannelFactory::<C>::new()), opts)
    }

    /// Register a pre-built channel factory for a topic pattern.
    ///
    /// # Panics
    ///
    /// Panics on an invalid pattern.
    pub fn route(
        mut self,
        pattern: &str,
        factory: Arc<dyn ChannelFactory>,
        opts: ChannelOpts,
    ) -> Self {
        self.routes.push(Route {
            pattern: TopicPattern::parse(pattern),
            factory,
            opts,
        });
        self
    }

    /// Declare a transport binding and its serializer configuration.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate transport name.
    pub fn transport(mut self, name: &str, serializers: SerializerSpec) -> Self {
        if self
            .transports
            .insert(name.to_string(), serializers)
            .is_some()
        {
            panic!("transport {:?} is declared twice", name);
        }
        self
    }

    /// Finish the registry.
    pub fn build(self) -> ChannelRegistry {
        ChannelRegistry {
            routes: self.routes,
            transports: self.transports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{HandleResult, JoinResult};
    use crate::socket::Socket;
    use async_trait::async_trait;
    use serde_json::json;

    struct AnyChannel;

    #[async_trait]
    impl Channel for AnyChannel {
        async fn join(_topic: &str, _payload: Value, _socket: &mut Socket) -> JoinResult<Self> {
            JoinResult::Ok(AnyChannel)
        }

        async fn handle_in(
            &mut self,
            _event: &str,
            _payload: Value,
            _socket: &mut Socket,
        ) -> HandleResult {
            HandleResult::NoReply
        }
    }

    #[test]
    fn exact_and_prefix_matching() {
        let exact = TopicPattern::parse("room:lobby");
        assert!(exact.matches("room:lobby"));
        assert!(!exact.matches("room:other"));

        let prefix = TopicPattern::parse("room:*");
        assert!(prefix.matches("room:lobby"));
        assert!(prefix.matches("room:"));
        assert!(!prefix.matches("user:1"));
    }

    #[test]
    #[should_panic(expected = "terminal position")]
    fn interior_splat_is_rejected() {
        let _ = TopicPattern::parse("a:*:b");
    }

    #[test]
    #[should_panic(expected = "entire trailing segment")]
    fn partial_segment_splat_is_rejected() {
        let _ = TopicPattern::parse("room*");
    }

    #[test]
    fn lookup_resolves_in_registration_order() {
        let registry = ChannelRegistry::builder()
            .channel::<AnyChannel>("room:lobby", ChannelOpts::new().assign("kind", json!("lobby")))
            .channel::<AnyChannel>("room:*", ChannelOpts::new().assign("kind", json!("any")))
            .build();

        let (_, opts) = registry.lookup("room:lobby").unwrap();
        assert_eq!(opts.assigns["kind"], json!("lobby"));

        let (_, opts) = registry.lookup("room:42").unwrap();
        assert_eq!(opts.assigns["kind"], json!("any"));

        assert!(registry.lookup("user:42").is_none());
        assert_eq!(registry.patterns().collect::<Vec<_>>(), vec!["room:lobby", "room:*"]);
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_transport_is_rejected() {
        use crate::serializer::json::JsonSerializer;

        let _ = ChannelRegistry::builder()
            .transport("websocket", SerializerSpec::new().with(JsonSerializer, "~2.0"))
            .transport("websocket", SerializerSpec::new().with(JsonSerializer, "~2.0"));
    }
}
