//! Streaming transports: Server-Sent Events and WebSocket.
//!
//! Both run one pipeline per request with a request-scoped cancellation
//! token. SSE cancels through a drop guard held by the response stream, so a
//! client that goes away stops synthesis. The WebSocket handler cancels when
//! the client closes the socket or a send fails.

use std::{convert::Infallible, fmt::Display, sync::atomic::Ordering};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tts_core::{
    event_stream, ChannelSink, ChunkEvent, EmitMeta, SinkError, StreamEvent, StreamReport,
    SynthesisParams, SynthesisResult, TransportSink,
};

use crate::{
    error::ApiError,
    validation::{EmptyText, SpeakRequest},
    AppState,
};

fn sse_event(event: &StreamEvent) -> Event {
    Event::default().event(event.name()).data(event.to_json())
}

/// `POST /tts/stream`: one SSE event per emitted unit, then `complete` or
/// `error`.
pub async fn tts_stream_sse(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let params = state.resolve_params(&req, EmptyText::Allow)?;

    // capacity 1: a slow client stalls the emitter instead of buffering audio
    let (mut sink, rx) = ChannelSink::bounded(1);
    let cancel = CancellationToken::new();

    let pipeline = state.pipeline.clone();
    let metrics = state.metrics.clone();
    let token = cancel.clone();
    metrics.streams.stream_started();
    tokio::spawn(async move {
        let report = pipeline.run(&req.text, params, &mut sink, token).await;
        metrics.streams.record_report(&report);
    });

    let guard = cancel.drop_guard();
    let mut events = Box::pin(event_stream(rx));
    let body = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = events.next().await {
            yield Ok::<_, Infallible>(sse_event(&event));
        }
    };

    Ok(Sse::new(body).keep_alive(KeepAlive::default()))
}

/// Writes each event as one WebSocket text message.
pub struct WsSink<S> {
    sender: S,
}

impl<S> WsSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        self.sender
            .send(Message::Text(event.to_json().into()))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sender.close().await {
            debug!(error = %e, "websocket close failed");
        }
    }
}

#[async_trait]
impl<S> TransportSink for WsSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    async fn emit(&mut self, result: &SynthesisResult, meta: EmitMeta) -> Result<(), SinkError> {
        let event = ChunkEvent::frame(result, meta)?;
        self.send(StreamEvent::Chunk(event)).await
    }

    async fn emit_complete(&mut self, total_chunks: usize) -> Result<(), SinkError> {
        self.send(StreamEvent::Complete { total_chunks }).await
    }

    async fn emit_error(&mut self, reason: &str) -> Result<(), SinkError> {
        self.send(StreamEvent::Error { error: reason.to_string() }).await
    }
}

/// `GET /stream`: the first text message carries the request JSON.
pub async fn stream_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Parse and validate the opening message of a WebSocket stream.
pub fn parse_ws_request(state: &AppState, message: &str) -> Result<(SpeakRequest, SynthesisParams), ApiError> {
    let req: SpeakRequest = serde_json::from_str(message)
        .map_err(|e| ApiError::InvalidInput(format!("Invalid request JSON: {e}")))?;
    let params = state.resolve_params(&req, EmptyText::Allow)?;
    Ok((req, params))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();
    serve_ws_stream(&state, sender, receiver).await;
}

/// Drive one WebSocket stream over an already split socket. Returns `None`
/// when no valid request arrived and no pipeline ran.
pub async fn serve_ws_stream<Tx, Rx, E>(state: &AppState, sender: Tx, mut receiver: Rx) -> Option<StreamReport>
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let mut sink = WsSink::new(sender);

    let opening = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text.as_str().to_owned(),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                debug!("websocket closed before a request arrived");
                return None;
            }
            Some(Ok(_)) => continue,
        }
    };

    let (req, params) = match parse_ws_request(state, &opening) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "rejected websocket stream request");
            let _ = sink.send(StreamEvent::Error { error: e.to_string() }).await;
            sink.close().await;
            return None;
        }
    };

    // the client closing its side cancels the stream
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            while let Some(msg) = receiver.next().await {
                if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
            cancel.cancel();
        }
    });

    state.metrics.streams.stream_started();
    let report = state.pipeline.run(&req.text, params, &mut sink, cancel).await;
    state.metrics.streams.record_report(&report);
    info!(outcome = ?report.outcome, emitted = report.emitted, "websocket stream finished");

    watcher.abort();
    sink.close().await;
    Some(report)
}
