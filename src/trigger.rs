//! Trigger Router (§4.4): forwards external trigger messages to the guest
//! agent and relays the reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::global;
use opentelemetry::propagation::{Injector, TextMapPropagator};
use tracing::{Instrument, Span, field, info_span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::bus::{Handler, Message, MessageBus};
use crate::config::NodeConfig;
use crate::telemetry::{Telemetry, TriggerLabel};

const TRIGGER_SUBJECT_HEADER: &str = "x-nex-trigger-subject";
const RUNTIME_NS_HEADER: &str = "x-nex-runtime-ns";

/// Carrier adapter so the W3C propagator can write into a bus `Message`'s
/// header map.
struct HeaderInjector<'a>(&'a mut std::collections::HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Builds per-(vmid, trigger-subject) handlers. Shared across all triggers so
/// the bus, telemetry, and timeout configuration are only constructed once.
pub struct TriggerRouter {
    bus: Arc<dyn MessageBus>,
    telemetry: Arc<Telemetry>,
    config: Arc<NodeConfig>,
}

impl TriggerRouter {
    pub fn new(bus: Arc<dyn MessageBus>, telemetry: Arc<Telemetry>, config: Arc<NodeConfig>) -> Self {
        Self {
            bus,
            telemetry,
            config,
        }
    }

    /// Builds the closure-equivalent handler for one (vmid, trigger-subject).
    pub fn handler_for(
        self: Arc<Self>,
        vmid: String,
        trigger_subject: String,
        workload_name: String,
        namespace: String,
    ) -> Arc<dyn Handler> {
        Arc::new(TriggerHandler {
            router: self,
            vmid,
            trigger_subject,
            workload_name,
            namespace,
        })
    }
}

struct TriggerHandler {
    router: Arc<TriggerRouter>,
    vmid: String,
    trigger_subject: String,
    workload_name: String,
    namespace: String,
}

#[async_trait]
impl Handler for TriggerHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        let span = info_span!(
            "workload-trigger",
            otel.kind = "server",
            workload.name = %self.workload_name,
            workload.namespace = %self.namespace,
            trigger.subject = %self.trigger_subject,
            otel.status_code = field::Empty,
        );

        async {
            let mut internal = Message::new(
                format!("agentint.{}.trigger", self.vmid),
                message.payload.clone(),
            )
            .with_header(TRIGGER_SUBJECT_HEADER, message.subject.clone());

            let cx = Span::current().context();
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&cx, &mut HeaderInjector(&mut internal.headers));
            });

            let label = TriggerLabel {
                workload_name: self.workload_name.clone(),
                namespace: self.namespace.clone(),
            };

            let timeout = Duration::from_millis(self.router.config.trigger_timeout_ms);
            match self.router.bus.request(internal, timeout).await {
                Ok(reply) => {
                    let runtime_ns: i64 = reply
                        .header(RUNTIME_NS_HEADER)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    self.router.telemetry.on_trigger_success(label, runtime_ns);
                    Span::current().record("otel.status_code", "OK");
                    Some(Message::new(message.subject.clone(), reply.payload))
                }
                Err(err) => {
                    warn!(
                        vmid = %self.vmid,
                        subject = %self.trigger_subject,
                        error = %err,
                        "trigger request failed"
                    );
                    self.router.telemetry.on_trigger_failure(label);
                    Span::current().record("otel.status_code", "ERROR");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use bytes::Bytes;

    struct Agent;

    #[async_trait]
    impl Handler for Agent {
        async fn handle(&self, message: Message) -> Option<Message> {
            assert_eq!(message.header("x-nex-trigger-subject"), Some("t.a"));
            Some(
                Message::new(message.subject, Bytes::from_static(b"pong"))
                    .with_header(RUNTIME_NS_HEADER, "1500000"),
            )
        }
    }

    #[tokio::test]
    async fn successful_trigger_relays_reply_and_increments_success() {
        let bus = Arc::new(LocalBus::new());
        let telemetry = Arc::new(Telemetry::new());
        let config = Arc::new(NodeConfig::minimal(&["v8"]));
        let router = Arc::new(TriggerRouter::new(
            bus.clone() as Arc<dyn MessageBus>,
            telemetry.clone(),
            config,
        ));

        bus.subscribe("agentint.vm-1.trigger", Arc::new(Agent))
            .await
            .unwrap();

        let handler = router.handler_for(
            "vm-1".to_string(),
            "t.a".to_string(),
            "echo".to_string(),
            "default".to_string(),
        );
        bus.subscribe("t.a", handler).await.unwrap();

        let reply = bus
            .request(
                Message::new("t.a", Bytes::from_static(b"ping")),
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"pong"));
        let label = TriggerLabel {
            workload_name: "echo".to_string(),
            namespace: "default".to_string(),
        };
        assert_eq!(telemetry.trigger_success_count(&label), 1);
    }

    #[tokio::test]
    async fn no_agent_subscriber_is_observed_as_failure() {
        let bus = Arc::new(LocalBus::new());
        let telemetry = Arc::new(Telemetry::new());
        let config = Arc::new(NodeConfig::minimal(&["v8"]));
        let router = Arc::new(TriggerRouter::new(
            bus.clone() as Arc<dyn MessageBus>,
            telemetry.clone(),
            config,
        ));

        let handler = router.handler_for(
            "vm-1".to_string(),
            "t.a".to_string(),
            "echo".to_string(),
            "default".to_string(),
        );
        bus.subscribe("t.a", handler).await.unwrap();

        let result = bus
            .request(
                Message::new("t.a", Bytes::from_static(b"ping")),
                Duration::from_millis(200),
            )
            .await;
        assert!(result.is_err());
        let label = TriggerLabel {
            workload_name: "echo".to_string(),
            namespace: "default".to_string(),
        };
        assert_eq!(telemetry.trigger_failure_count(&label), 1);
    }
}
