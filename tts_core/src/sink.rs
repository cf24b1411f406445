//! Transport sinks: frame each emitted result for a client connection.

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    audio::{self, pause_after_ms},
    unit::SynthesisResult,
    wav,
};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("encoding failed: {0}")]
    Encode(#[from] anyhow::Error),
}

/// Per-emission metadata decided by the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitMeta {
    /// Position among successful payloads; `None` for failed units.
    pub chunk_index: Option<usize>,
    pub total_units: usize,
    /// Set only on the last unit of the stream when it succeeded.
    pub is_final: bool,
}

/// Receives results strictly in unit order. Every call is one
/// self-contained message and must be flushed before returning.
#[async_trait]
pub trait TransportSink: Send {
    async fn emit(&mut self, result: &SynthesisResult, meta: EmitMeta) -> Result<(), SinkError>;

    async fn emit_complete(&mut self, total_chunks: usize) -> Result<(), SinkError>;

    async fn emit_error(&mut self, reason: &str) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    pub sentence_index: usize,
    pub total_sentences: usize,
    pub text: String,
    /// Base64 WAV; empty for failed units.
    pub audio: String,
    pub audio_size: usize,
    pub sample_rate: u32,
    pub duration_ms: u64,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkEvent {
    pub fn frame(result: &SynthesisResult, meta: EmitMeta) -> anyhow::Result<Self> {
        let (audio, audio_size, sample_rate, duration_ms) = if result.is_ok() {
            let (samples, sample_rate) = result.samples();
            let bytes = wav::encode_wav(&samples, sample_rate)?;
            let size = bytes.len();
            (
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
                size,
                sample_rate,
                audio::duration_ms(samples.len(), sample_rate),
            )
        } else {
            (String::new(), 0, 0, 0)
        };

        Ok(Self {
            chunk_index: meta.chunk_index,
            sentence_index: result.index,
            total_sentences: meta.total_units,
            text: result.text.clone(),
            audio,
            audio_size,
            sample_rate,
            duration_ms,
            is_final: meta.is_final,
            error: result.failure_reason().map(str::to_string),
        })
    }
}

/// Wire events, tagged by `"event"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk(ChunkEvent),
    Complete { total_chunks: usize },
    Error { error: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Chunk(_) => "chunk",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }

    pub fn to_json(&self) -> String {
        // plain structs of strings and numbers always serialize
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"event":"error","error":"serialization failed: {e}"}}"#)
        })
    }
}

/// Hands framed events to a bounded channel. A full channel stalls the
/// emitter; a dropped receiver is a closed transport.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus receiver. Capacity 1 keeps at most one framed event between
    /// the emitter and the client.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        self.tx.send(event).await.map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl TransportSink for ChannelSink {
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

/// Drain a channel sink's receiver as a stream, ending after the terminal
/// event.
pub fn event_stream(mut rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let done = event.is_terminal();
            yield event;
            if done {
                break;
            }
        }
    }
}

/// Joins every unit into one clip, with a short pause between units.
/// Used by one-shot synthesis.
#[derive(Debug, Default)]
pub struct CollectingSink {
    samples: Vec<f32>,
    sample_rate: Option<u32>,
    previous_text: Option<String>,
    failures: Vec<(usize, String)>,
    units: usize,
    terminal_error: Option<String>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Joined samples and sample rate; any failed unit or stream error fails
    /// the whole clip.
    pub fn into_audio(self) -> anyhow::Result<(Vec<f32>, u32)> {
        if let Some(err) = self.terminal_error {
            return Err(anyhow::anyhow!("stream failed: {err}"));
        }
        if let Some((index, reason)) = self.failures.first() {
            return Err(anyhow::anyhow!(
                "{} of {} sentence(s) failed; sentence {index}: {reason}",
                self.failures.len(),
                self.units
            ));
        }
        let sample_rate = self
            .sample_rate
            .ok_or_else(|| anyhow::anyhow!("no audio was produced"))?;
        Ok((self.samples, sample_rate))
    }
}

#[async_trait]
impl TransportSink for CollectingSink {
    async fn emit(&mut self, result: &SynthesisResult, _meta: EmitMeta) -> Result<(), SinkError> {
        self.units += 1;
        if let Some(reason) = result.failure_reason() {
            self.failures.push((result.index, reason.to_string()));
            return Ok(());
        }

        let (samples, rate) = result.samples();
        match self.sample_rate {
            Some(existing) if existing != rate => {
                self.failures
                    .push((result.index, format!("sample rate {rate} differs from {existing}")));
                return Ok(());
            }
            _ => self.sample_rate = Some(rate),
        }
        if let Some(prev) = &self.previous_text {
            let pause = (pause_after_ms(prev) as u64 * rate as u64 / 1000) as usize;
            self.samples.extend(std::iter::repeat(0.0).take(pause));
        }
        self.samples.extend(samples);
        self.previous_text = Some(result.text.clone());
        Ok(())
    }

    async fn emit_complete(&mut self, _total_chunks: usize) -> Result<(), SinkError> {
        Ok(())
    }

    async fn emit_error(&mut self, reason: &str) -> Result<(), SinkError> {
        self.terminal_error = Some(reason.to_string());
        Ok(())
    }
}
