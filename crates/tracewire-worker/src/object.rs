//! The example Durable Object.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracewire_rpc::{DurableObject, InboundRelay, ObjectContext, RpcError, Traced, decode, encode};

use crate::error::ProgramError;
use crate::programs::{run_forked_program, run_program, run_program_with_error};

pub const RUN_EFFECT: &str = "runEffect";
pub const RUN_EFFECT_WITH_ERROR: &str = "runEffectWithError";
pub const RUN_FORKED_EFFECT: &str = "runForkedEffect";

/// Arguments accepted by every [`ExampleObject`] method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExampleProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub just_to_show_that_types_work: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    RunEffect,
    RunEffectWithError,
    RunForkedEffect,
}

impl Method {
    fn parse(name: &str) -> Option<Self> {
        match name {
            RUN_EFFECT => Some(Self::RunEffect),
            RUN_EFFECT_WITH_ERROR => Some(Self::RunEffectWithError),
            RUN_FORKED_EFFECT => Some(Self::RunForkedEffect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub hello: String,
}

/// Runs the demo programs behind traced RPC methods.
#[derive(Debug, Clone)]
pub struct ExampleObject {
    relay: InboundRelay,
    fork_delay: Duration,
}

impl ExampleObject {
    pub fn new(relay: InboundRelay, fork_delay: Duration) -> Self {
        Self { relay, fork_delay }
    }
}

#[async_trait]
impl DurableObject for ExampleObject {
    async fn call(
        &mut self,
        method: &str,
        args: Value,
        ctx: &ObjectContext,
    ) -> tracewire_rpc::Result<Value> {
        let Some(dispatch) = Method::parse(method) else {
            return Err(RpcError::UnknownMethod(method.to_string()));
        };
        let args: Traced<ExampleProps> = decode(args)?;
        let span_name = format!("durable-object-{method}");
        let tasks = ctx.tasks();

        let result = match dispatch {
            Method::RunEffect => {
                self.relay
                    .continue_traced(
                        &span_name,
                        |_: ExampleProps| async {
                            run_program().await?;
                            Ok::<_, ProgramError>(Some(Greeting {
                                hello: "from durable object".to_string(),
                            }))
                        },
                        tasks,
                        args,
                    )
                    .await
            }
            Method::RunEffectWithError => {
                self.relay
                    .continue_traced(
                        &span_name,
                        |_: ExampleProps| async {
                            run_program_with_error().await?;
                            Ok::<_, ProgramError>(Some(Greeting {
                                hello: "from durable object (this should not be reached due to error)"
                                    .to_string(),
                            }))
                        },
                        tasks,
                        args,
                    )
                    .await
            }
            Method::RunForkedEffect => {
                let delay = self.fork_delay;
                self.relay
                    .continue_traced(
                        &span_name,
                        |props: ExampleProps| async move {
                            tracing::debug!(?props, "Forking background program");
                            run_forked_program(tasks, delay).await?;
                            Ok::<_, ProgramError>(None)
                        },
                        tasks,
                        args,
                    )
                    .await
            }
        };

        match result {
            Ok(greeting) => encode(&greeting),
            Err(e) => Err(RpcError::from_reportable(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use serde_json::{Map, json};
    use tracewire_rpc::DurableObjectNamespace;
    use tracewire_tracing::{ClientOptions, MemoryTransport, ORIGIN_ATTRIBUTE, with_tracing};

    use crate::programs::{CHILD_ERROR_MESSAGE, CHILD_ERROR_NAME};

    fn namespace() -> (DurableObjectNamespace<ExampleObject>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let relay = InboundRelay::new(ClientOptions::default(), transport.clone());
        let ns = DurableObjectNamespace::new(move |_| {
            ExampleObject::new(relay.clone(), Duration::from_millis(10))
        });
        (ns, transport)
    }

    #[tokio::test]
    async fn test_run_effect_returns_greeting() {
        let (ns, transport) = namespace();
        let stub = ns.get_by_name("static-name");

        let (result, caller) = with_tracing(async {
            stub.call_traced::<_, Value>(RUN_EFFECT, ExampleProps::default()).await
        })
        .await;
        assert_eq!(result.unwrap(), json!({"hello": "from durable object"}));

        assert_eq!(ns.shutdown().await, 1);
        let trace = &transport.transactions()[0];
        assert_eq!(trace.trace_id, caller.trace_id);
        let span = trace.find_span("durable-object-runEffect").unwrap();
        assert_eq!(span.op.as_deref(), Some("rpc"));
        assert_eq!(span.attributes[ORIGIN_ATTRIBUTE], "auto.rpc.durable_object");
        assert!(span.find("parentEffect").is_some());
    }

    #[tokio::test]
    async fn test_run_effect_with_error_keeps_error_name() {
        let (ns, transport) = namespace();
        let stub = ns.get_by_name("static-name");

        let err = stub
            .call_traced::<_, Value>(RUN_EFFECT_WITH_ERROR, ExampleProps::default())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::remote(CHILD_ERROR_NAME, CHILD_ERROR_MESSAGE));

        ns.shutdown().await;
        assert!(transport.transactions()[0].has_error());
        assert_eq!(transport.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_run_forked_effect_registers_background_work() {
        let (ns, transport) = namespace();
        let stub = ns.get_by_name("static-name");
        let props = ExampleProps {
            just_to_show_that_types_work: Some(true),
        };

        let result: Value = stub.call_traced(RUN_FORKED_EFFECT, props).await.unwrap();
        assert_eq!(result, Value::Null);

        // The relay flush plus the background transaction
        assert_eq!(ns.shutdown().await, 2);
        let sent = transport.transactions();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|t| t.trace_id == sent[0].trace_id));
        let background = sent
            .iter()
            .find(|t| t.name.as_deref() == Some("effectWithBackgroundFork"))
            .unwrap();
        assert!(background.find_span("parentEffect").is_some());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (ns, _) = namespace();
        let err = ns
            .get_by_name("static-name")
            .call::<_, Value>("nope", Traced::new(Map::new()))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::UnknownMethod("nope".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_method_wins_over_bad_arguments() {
        let (ns, _) = namespace();
        let stub = ns.get_by_name("static-name");

        let err = stub
            .call::<_, Value>("nope", Traced::new(json!({"justToShowThatTypesWork": "yes"})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::UnknownMethod("nope".to_string()));

        // Known methods still reject them
        let err = stub
            .call::<_, Value>(RUN_EFFECT, Traced::new(json!({"justToShowThatTypesWork": "yes"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Serialization(_)));
    }
}
