//! The streaming pipeline: framer → reassembler → scanner.
//!
//! [`StreamDecoder`] is the pure part and owns all per-stream buffers.
//! [`relay_stream`] drives it from an upstream byte stream, forwarding clean text
//! to the client and completed markers to the dispatcher queue.

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collaborators::ByteStream;
use crate::error::{ClientError, RelayError};
use crate::framer::{DEFAULT_MAX_LINE_BYTES, Frame, LineFramer};
use crate::marker::RawMarker;
use crate::reassembler::{DEFAULT_MAX_REASSEMBLY_BYTES, Reassembler};
use crate::scanner::{DEFAULT_MAX_MARKER_BYTES, MarkerScanner, ScanEvent};

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub max_line_bytes: usize,
    pub max_reassembly_bytes: usize,
    pub max_marker_bytes: usize,
    /// Capacity of the per-turn client event channel
    pub event_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_reassembly_bytes: DEFAULT_MAX_REASSEMBLY_BYTES,
            max_marker_bytes: DEFAULT_MAX_MARKER_BYTES,
            event_buffer: 64,
        }
    }
}

/// What the client channel carries for one turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// Always first
    Session(String),
    /// Clean text, or the wire form of a client-visible hint
    Text(String),
    Done,
    /// At most one, always last
    Error(ClientError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub frames: u64,
    pub malformed_frames: u64,
    pub abandoned_reassemblies: u64,
    pub markers_completed: u64,
    pub markers_dropped: u64,
    pub hints: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    Scan(ScanEvent),
    /// Terminal-value payload (`finish_reason`); the stream continues
    Finished(String),
    /// Error object reported inside the stream
    UpstreamError(String),
    /// Terminal sentinel or end of input
    End,
}

/// Pure decoder for one stream. Bytes in, ordered [`Decoded`] items out.
pub struct StreamDecoder {
    framer: LineFramer,
    reassembler: Reassembler,
    scanner: MarkerScanner,
    terminated: bool,
    stats: RelayStats,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

impl StreamDecoder {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            framer: LineFramer::with_max_line_bytes(config.max_line_bytes),
            reassembler: Reassembler::with_max_bytes(config.max_reassembly_bytes),
            scanner: MarkerScanner::with_max_marker_bytes(config.max_marker_bytes),
            terminated: false,
            stats: RelayStats::default(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            malformed_frames: self.framer.malformed_count(),
            abandoned_reassemblies: self.reassembler.abandoned_count(),
            ..self.stats.clone()
        }
    }

    /// Feed one upstream read. Anything after the end of the stream is ignored.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        if self.terminated {
            return out;
        }
        for frame in self.framer.push(bytes) {
            self.on_frame(frame, &mut out);
            if self.terminated {
                break;
            }
        }
        out
    }

    /// Transport end of input.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        if self.terminated {
            return out;
        }
        if let Some(frame) = self.framer.finish() {
            self.on_frame(frame, &mut out);
        }
        if !self.terminated {
            debug!("upstream closed without terminal sentinel");
            self.reassembler.boundary();
            self.end(&mut out);
        }
        out
    }

    /// Drop all buffered state without emitting it.
    pub fn abandon(&mut self) {
        self.scanner.abandon();
        self.terminated = true;
    }

    fn on_frame(&mut self, frame: Frame, out: &mut Vec<Decoded>) {
        self.stats.frames += 1;
        match frame {
            Frame::Data(payload) => {
                let Some(record) = self.reassembler.push(&payload) else {
                    return;
                };
                if let Some(error) = record.error {
                    self.scanner.abandon();
                    self.terminated = true;
                    out.push(Decoded::UpstreamError(error));
                    return;
                }
                if let Some(delta) = record.delta {
                    let events = self.scanner.push(&delta);
                    self.collect(events, out);
                }
                if let Some(reason) = record.finish_reason {
                    out.push(Decoded::Finished(reason));
                }
            }
            Frame::Boundary => self.reassembler.boundary(),
            Frame::Comment | Frame::Field => {}
            Frame::Terminal => {
                self.reassembler.boundary();
                self.end(out);
            }
        }
    }

    fn end(&mut self, out: &mut Vec<Decoded>) {
        let events = self.scanner.finish();
        self.collect(events, out);
        self.terminated = true;
        out.push(Decoded::End);
    }

    fn collect(&mut self, events: Vec<ScanEvent>, out: &mut Vec<Decoded>) {
        for event in events {
            match &event {
                ScanEvent::Marker(_) => self.stats.markers_completed += 1,
                ScanEvent::Dropped(_) => self.stats.markers_dropped += 1,
                ScanEvent::Hint(_) => self.stats.hints += 1,
                ScanEvent::Text(_) => {}
            }
            out.push(Decoded::Scan(event));
        }
    }
}

/// Result of relaying one upstream stream.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Everything delivered to the client, hints included
    pub clean_text: String,
    pub stats: RelayStats,
    pub finish_reason: Option<String>,
    pub result: Result<(), RelayError>,
}

/// Relay `upstream` until it ends, fails, or `cancel` fires.
///
/// Clean text goes to `events` as it is produced; completed markers (and hints)
/// go to `markers`. Neither a `Done` nor an `Error` event is sent here.
pub async fn relay_stream(
    mut upstream: ByteStream,
    events: &mpsc::Sender<RelayEvent>,
    markers: &mpsc::UnboundedSender<RawMarker>,
    cancel: &CancellationToken,
    config: &RelayConfig,
) -> RelayOutcome {
    let mut decoder = StreamDecoder::new(config);
    let mut outcome = RelayOutcome {
        clean_text: String::new(),
        stats: RelayStats::default(),
        finish_reason: None,
        result: Ok(()),
    };

    let result = async {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                next = upstream.next() => next,
            };
            let decoded = match next {
                Some(Ok(bytes)) => decoder.push_bytes(&bytes),
                Some(Err(e)) => return Err(e),
                None => decoder.finish(),
            };
            for item in decoded {
                match item {
                    Decoded::Scan(ScanEvent::Text(text)) => {
                        send_event(events, cancel, RelayEvent::Text(text.clone())).await?;
                        outcome.clean_text.push_str(&text);
                    }
                    Decoded::Scan(ScanEvent::Hint(hint)) => {
                        let wire = hint.to_wire();
                        send_event(events, cancel, RelayEvent::Text(wire.clone())).await?;
                        outcome.clean_text.push_str(&wire);
                        enqueue(markers, hint);
                    }
                    Decoded::Scan(ScanEvent::Marker(marker)) => enqueue(markers, marker),
                    Decoded::Scan(ScanEvent::Dropped(dropped)) => {
                        debug!(marker = dropped.kind.name(), reason = ?dropped.reason, "marker dropped");
                    }
                    Decoded::Finished(reason) => outcome.finish_reason = Some(reason),
                    Decoded::UpstreamError(message) => {
                        return Err(RelayError::UpstreamReported(message));
                    }
                    Decoded::End => return Ok(()),
                }
            }
        }
    }
    .await;

    if result.is_err() {
        decoder.abandon();
    }
    outcome.stats = decoder.stats();
    outcome.result = result;
    outcome
}

async fn send_event(
    events: &mpsc::Sender<RelayEvent>,
    cancel: &CancellationToken,
    event: RelayEvent,
) -> Result<(), RelayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        sent = events.send(event) => sent.map_err(|_| RelayError::Cancelled),
    }
}

fn enqueue(markers: &mpsc::UnboundedSender<RawMarker>, marker: RawMarker) {
    if markers.send(marker).is_err() {
        warn!("dispatcher is gone, marker not dispatched");
    }
}
