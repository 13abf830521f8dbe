//! The per-request gateway: transaction setup, dialect handling, event
//! emission, and the streaming frame driver.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::http::HeaderMap;
use config::Config;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::json;
use storage::{Database, EventBus, EventSink, RequestLogRecord, event_types};

use crate::convert::to_anthropic::messages_response_from_chat;
use crate::error::ProxyResult;
use crate::messages::anthropic::MessagesResponse;
use crate::messages::openai::{ChatChunk, ChatRequest, ChatResponse};
use crate::observability::context::ObservabilityContext;
use crate::observability::recorder::TransactionRecorder;
use crate::orchestrator::PolicyOrchestrator;
use crate::policy::manager::PolicyManager;
use crate::upstream::Backend;

pub use crate::streaming::sse::formatter::WireFrame;
use crate::streaming::sse::formatter::{AnthropicFormatter, ClientFormatter, OpenAiFormatter};

/// Which wire dialect the client spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

/// The body of a completed (or streaming) transaction.
pub enum CompletionOutcome {
    /// Non-streaming, normalized dialect.
    Json(Box<ChatResponse>),
    /// Non-streaming, Anthropic dialect.
    AnthropicJson(Box<MessagesResponse>),
    /// Streaming: SSE frames ready for the wire.
    Stream(BoxStream<'static, WireFrame>),
}

/// A transaction's id plus its outcome.
pub struct CompletionReply {
    pub call_id: String,
    pub outcome: CompletionOutcome,
}

/// Shared per-process state behind the HTTP handlers.
pub struct Gateway {
    config: Config,
    backend: Arc<dyn Backend>,
    policies: Arc<PolicyManager>,
    sink: EventSink,
    db: Option<Database>,
    bus: Option<EventBus>,
}

impl Gateway {
    pub fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        policies: Arc<PolicyManager>,
        sink: EventSink,
        db: Option<Database>,
        bus: Option<EventBus>,
    ) -> Self {
        Self {
            config,
            backend,
            policies,
            sink,
            db,
            bus,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> Option<&EventBus> {
        self.bus.as_ref()
    }

    pub fn policies(&self) -> &Arc<PolicyManager> {
        &self.policies
    }

    /// Run one transaction end to end.
    pub async fn handle_completion(
        self: &Arc<Self>,
        headers: &HeaderMap,
        mut request: ChatRequest,
        dialect: Dialect,
    ) -> ProxyResult<CompletionReply> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let session_id = session_id_from(headers, &request);

        let obs = Arc::new(ObservabilityContext::new(
            call_id.clone(),
            session_id,
            self.sink.clone(),
        ));

        self.sink.begin_call(&call_id, &request.model);
        obs.record_event(
            event_types::CLIENT_REQUEST,
            json!({"request": request, "streaming": request.wants_stream()}),
        );
        self.log_inbound_request(&call_id, &request);

        request.normalize();

        let result = self.run_transaction(&obs, request, dialect).await;

        match result {
            Ok(outcome) => Ok(CompletionReply { call_id, outcome }),
            Err(error) => {
                obs.record_event(
                    "pipeline.error",
                    json!({"error": error.to_string(), "error_type": error.error_type()}),
                );
                self.sink.finish_call(&call_id, "error");
                Err(error)
            }
        }
    }

    async fn run_transaction(
        self: &Arc<Self>,
        obs: &Arc<ObservabilityContext>,
        request: ChatRequest,
        dialect: Dialect,
    ) -> ProxyResult<CompletionOutcome> {
        let _span = obs.span("transaction");

        let policy = self.policies.current();
        let orchestrator = PolicyOrchestrator::new(policy, &self.config.stream);

        let mut ctx = crate::policy::context::PolicyContext::new(Arc::clone(obs), Arc::new(request.clone()));
        let final_request = orchestrator.process_request(request, &mut ctx).await?;

        let recorder = Arc::new(TransactionRecorder::new(
            Arc::clone(obs),
            self.config.stream.chunk_buffer_cap,
        ));

        if final_request.wants_stream() {
            let model = final_request.model.clone();
            let upstream = self.backend.stream(final_request).await?;
            let handles = orchestrator.launch_stream(ctx, upstream, Arc::clone(&recorder));

            let formatter: Box<dyn ClientFormatter> = match dialect {
                Dialect::OpenAi => Box::new(OpenAiFormatter),
                Dialect::Anthropic => Box::new(AnthropicFormatter::new(model)),
            };

            Ok(CompletionOutcome::Stream(stream_frames(StreamDriver {
                output: handles.output,
                task: Some(handles.task),
                formatter,
                recorder,
                obs: Arc::clone(obs),
                sink: self.sink.clone(),
                pending: VecDeque::new(),
                done: false,
            })))
        } else {
            let original = self.backend.complete(final_request).await?;
            let final_response = orchestrator
                .process_full_response(original, &mut ctx, &recorder)
                .await?;

            obs.record_event(
                event_types::CLIENT_RESPONSE,
                json!({"response": final_response, "streaming": false}),
            );
            self.sink.finish_call(obs.call_id(), "success");

            match dialect {
                Dialect::OpenAi => Ok(CompletionOutcome::Json(Box::new(final_response))),
                Dialect::Anthropic => {
                    let (converted, warnings) = messages_response_from_chat(final_response);
                    for warning in warnings {
                        obs.record_event(event_types::WARNING, json!({"message": warning.0}));
                    }
                    Ok(CompletionOutcome::AnthropicJson(Box::new(converted)))
                }
            }
        }
    }

    /// Optional inbound HTTP logging; storage trouble stays off the hot path.
    fn log_inbound_request(&self, call_id: &str, request: &ChatRequest) {
        let Some(db) = self.db.clone() else { return };

        let record = RequestLogRecord {
            transaction_id: call_id.to_string(),
            direction: "inbound".to_string(),
            http_method: "POST".to_string(),
            url: "/v1/chat/completions".to_string(),
            request_headers: None,
            request_body: serde_json::to_value(request).ok(),
            response_status: None,
            response_body: None,
        };

        tokio::spawn(async move {
            if let Err(error) = db.record_request_log(&record).await {
                log::error!("failed to record inbound request log: {error:#}");
            }
        });
    }
}

fn session_id_from(headers: &HeaderMap, request: &ChatRequest) -> Option<String> {
    headers
        .get("x-session-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.session_id().map(str::to_string))
}

struct StreamDriver {
    output: tokio::sync::mpsc::Receiver<Option<ChatChunk>>,
    task: Option<tokio::task::JoinHandle<ProxyResult<()>>>,
    formatter: Box<dyn ClientFormatter>,
    recorder: Arc<TransactionRecorder>,
    obs: Arc<ObservabilityContext>,
    sink: EventSink,
    pending: VecDeque<WireFrame>,
    done: bool,
}

/// Drive the output queue through the client formatter, finalizing the
/// recorder and closing out the transaction when the sentinel arrives.
fn stream_frames(driver: StreamDriver) -> BoxStream<'static, WireFrame> {
    futures::stream::unfold(driver, |mut driver| async move {
        loop {
            if let Some(frame) = driver.pending.pop_front() {
                return Some((frame, driver));
            }

            if driver.done {
                return None;
            }

            match driver.output.recv().await {
                Some(Some(chunk)) => {
                    driver.pending.extend(driver.formatter.on_chunk(chunk));
                    for warning in driver.formatter.take_warnings() {
                        driver.obs.record_event(event_types::WARNING, json!({"message": warning.0}));
                    }
                }
                // Sentinel or closed channel: the stream is over either way.
                Some(None) | None => {
                    driver.done = true;

                    let outcome = match driver.task.take() {
                        Some(task) => match task.await {
                            Ok(result) => result,
                            Err(join_error) => {
                                log::error!("dispatcher task panicked or was aborted: {join_error}");
                                Err(crate::error::ProxyError::Internal(None))
                            }
                        },
                        None => Ok(()),
                    };

                    let status = match outcome {
                        Ok(()) => {
                            driver.pending.extend(driver.formatter.finish());
                            "success"
                        }
                        Err(error) => {
                            log::error!("streaming transaction failed: {error}");
                            driver.obs.record_event(
                                "pipeline.error",
                                json!({"error": error.to_string(), "error_type": error.error_type()}),
                            );
                            driver.pending.extend(driver.formatter.on_error(&error));
                            "error"
                        }
                    };

                    driver.recorder.finalize_streaming();
                    driver.obs.record_event(
                        event_types::CLIENT_RESPONSE,
                        json!({"streaming": true, "status": status}),
                    );
                    driver.sink.finish_call(driver.obs.call_id(), status);
                }
            }
        }
    })
    .boxed()
}
