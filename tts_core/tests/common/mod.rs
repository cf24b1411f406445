//! Shared helpers for pipeline integration tests

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tts_core::{
    AudioFrame, ChunkEvent, EmitMeta, SinkError, StreamEvent, SynthesisBackend, SynthesisParams,
    SynthesisResult, TransportSink, VoiceRef,
};

pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Delay(Duration),
    Fail,
    Panic,
    Empty,
}

/// Backend whose per-unit behavior is scripted by unit text.
pub struct ScriptedBackend {
    script: HashMap<String, Behavior>,
    default_delay: Duration,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub calls: AtomicUsize,
    pub completion_order: Mutex<Vec<String>>,
    /// Emitted count seen by the sink, for lookahead checks.
    pub emitted: Arc<AtomicUsize>,
    /// Largest `index - emitted` observed when a call started.
    pub max_lookahead: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            script: HashMap::new(),
            default_delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            completion_order: Mutex::new(Vec::new()),
            emitted: Arc::new(AtomicUsize::new(0)),
            max_lookahead: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, text: &str, behavior: Behavior) -> Self {
        self.script.insert(text.to_string(), behavior);
        self
    }

    pub fn completed(&self) -> Vec<String> {
        self.completion_order.lock().unwrap().clone()
    }
}

/// Index encoded in texts like `"u7."`.
pub fn index_of(text: &str) -> Option<usize> {
    text.strip_prefix('u')?.trim_end_matches('.').parse().ok()
}

/// `"u0. u1. u2. ..."`
pub fn numbered_text(n: usize) -> String {
    (0..n).map(|i| format!("u{i}.")).collect::<Vec<_>>().join(" ")
}

impl SynthesisBackend for ScriptedBackend {
    fn synthesize(&self, text: &str, _voice: &VoiceRef, _speed: f32) -> anyhow::Result<Vec<AudioFrame>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(index) = index_of(text) {
            let emitted = self.emitted.load(Ordering::SeqCst);
            self.max_lookahead
                .fetch_max(index.saturating_sub(emitted), Ordering::SeqCst);
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .script
            .get(text)
            .copied()
            .unwrap_or(Behavior::Delay(self.default_delay));
        let result = match behavior {
            Behavior::Delay(d) => {
                std::thread::sleep(d);
                Ok(vec![
                    AudioFrame::new(vec![0.2; 80], SAMPLE_RATE),
                    AudioFrame::new(vec![-0.1; 80], SAMPLE_RATE),
                ])
            }
            Behavior::Fail => Err(anyhow::anyhow!("scripted failure")),
            Behavior::Empty => Ok(Vec::new()),
            Behavior::Panic => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                panic!("scripted panic");
            }
        };

        self.completion_order.lock().unwrap().push(text.to_string());
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Sink that records framed events and can be told to misbehave.
pub struct RecordingSink {
    pub events: Vec<StreamEvent>,
    emitted: Arc<AtomicUsize>,
    delay: Duration,
    fail_at: Option<usize>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingSink {
    pub fn new(emitted: Arc<AtomicUsize>) -> Self {
        Self {
            events: Vec::new(),
            emitted,
            delay: Duration::ZERO,
            fail_at: None,
            cancel_after: None,
        }
    }

    pub fn detached() -> Self {
        Self::new(Arc::new(AtomicUsize::new(0)))
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the transport on the n-th chunk emission (0-based).
    pub fn failing_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// Cancel `token` right after the n-th chunk emission (1-based count).
    pub fn cancelling_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn chunks(&self) -> Vec<&ChunkEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn sentence_indices(&self) -> Vec<usize> {
        self.chunks().iter().map(|c| c.sentence_index).collect()
    }

    pub fn terminal(&self) -> Option<&StreamEvent> {
        self.events.last().filter(|e| e.is_terminal())
    }
}

#[async_trait]
impl TransportSink for RecordingSink {
    async fn emit(&mut self, result: &SynthesisResult, meta: EmitMeta) -> Result<(), SinkError> {
        let n = self.chunks().len();
        if self.fail_at == Some(n) {
            return Err(SinkError::Transport("connection reset".into()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.events.push(StreamEvent::Chunk(ChunkEvent::frame(result, meta)?));
        self.emitted.fetch_add(1, Ordering::SeqCst);
        if let Some((after, token)) = &self.cancel_after {
            if n + 1 == *after {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn emit_complete(&mut self, total_chunks: usize) -> Result<(), SinkError> {
        self.events.push(StreamEvent::Complete { total_chunks });
        Ok(())
    }

    async fn emit_error(&mut self, reason: &str) -> Result<(), SinkError> {
        self.events.push(StreamEvent::Error { error: reason.to_string() });
        Ok(())
    }
}

pub fn params() -> SynthesisParams {
    SynthesisParams {
        voice: VoiceRef::language("en_US"),
        speed: 1.0,
        normalize: false,
    }
}
