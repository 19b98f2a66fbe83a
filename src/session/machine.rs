//! # Call Session State Machine
//!
//! Drives one carrier connection through its turn-taking lifecycle.
//!
//! ## States:
//! 1. **Listening** (initial): Caller audio is buffered, every accepted frame re-arms the
//!    silence timer
//! 2. **Speaking**: The buffered turn is being echoed back one frame per pacing interval
//! 3. **Stopped** (terminal): The call ended; nothing is processed any more
//!
//! ## Transitions:
//! - Listening + media → buffer the frame, re-arm the timer
//! - Listening + silence → drain the buffer and start playback (no-op if empty)
//! - Speaking + last frame played → back to Listening one pacing interval later
//! - any + clear → cancel timer, abort playback, drop buffer, Listening, send clear ack
//! - any + dtmf/mark → acknowledge, nothing else changes
//! - any + stop, or transport closed → cancel timer, drop buffer, Stopped
//!
//! Media that arrives while Speaking is dropped, not queued for the next turn.
//!
//! ## Concurrency Model:
//! Each session is a single tokio task that owns all of its state. Carrier frames,
//! timer fires and the close signal all arrive through one ordered inbox, so they can
//! never race each other. Playback does not block the inbox: the task `select!`s
//! between the next inbox message and the next frame's due time, preferring the inbox,
//! so a clear or stop lands between two echoed frames.

use crate::config::{EchoMode, SessionConfig};
use crate::error::SessionError;
use crate::monitor::{CallRecord, EventReporter, RecordKind};
use crate::protocol::{decode, encode, AudioFrame, InboundEvent, OutboundFrame, StartInfo};
use crate::session::buffer::TurnBuffer;
use crate::session::timer::SilenceTimer;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Where outbound text frames go. Implemented by the WebSocket transport.
pub trait FrameSink: Send + Sync + 'static {
    fn send_text(&self, text: String) -> Result<(), SessionError>;
}

impl FrameSink for mpsc::UnboundedSender<String> {
    fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.send(text)
            .map_err(|_| SessionError::SendFailure("outbound channel closed".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Listening,
    Speaking,
    Stopped,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Listening => "listening",
            TurnState::Speaking => "speaking",
            TurnState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a session task can be told.
#[derive(Debug)]
pub(crate) enum SessionInput {
    /// Raw text frame from the carrier
    Inbound(String),
    /// The silence timer armed with this generation ran out
    SilenceElapsed { generation: u64 },
    /// The transport connection is gone
    Close,
}

/// Whether the session task keeps running after an input.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// An in-progress echo of one buffered turn.
struct Playback {
    turn: u64,
    frames: VecDeque<AudioFrame>,
    total: usize,
    next_at: Instant,
}

/// State of one carrier connection. Owned by exactly one task.
pub struct CallSession {
    connection_id: String,
    stream_sid: Option<String>,
    call_sid: Option<String>,
    state: TurnState,
    turn: u64,
    buffer: TurnBuffer,
    timer: SilenceTimer,
    playback: Option<Playback>,
    config: SessionConfig,
    sink: Arc<dyn FrameSink>,
    reporter: Arc<dyn EventReporter>,
    inbox: mpsc::WeakUnboundedSender<SessionInput>,
}

impl CallSession {
    pub(crate) fn new(
        connection_id: String,
        config: SessionConfig,
        timer: SilenceTimer,
        sink: Arc<dyn FrameSink>,
        reporter: Arc<dyn EventReporter>,
        inbox: mpsc::WeakUnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            connection_id,
            stream_sid: None,
            call_sid: None,
            state: TurnState::Listening,
            turn: 0,
            buffer: TurnBuffer::new(),
            timer,
            playback: None,
            config,
            sink,
            reporter,
            inbox,
        }
    }

    /// Process inputs until the call stops or the transport goes away.
    pub(crate) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        self.report(RecordKind::SessionOpened, json!({ "echo_mode": self.config.echo_mode }));
        info!(connection_id = %self.connection_id, "👂 Session listening");

        loop {
            let next_frame_at = self.playback.as_ref().map(|p| p.next_at);

            let result = tokio::select! {
                biased;

                input = inbox.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => {
                        self.shutdown("inbox closed");
                        break;
                    }
                },

                _ = tokio::time::sleep_until(next_frame_at.unwrap_or_else(Instant::now)),
                    if next_frame_at.is_some() => self.advance_playback().map(|_| Flow::Continue),
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(SessionError::SendFailure(reason)) => {
                    error!(connection_id = %self.connection_id, %reason, "❌ Outbound send failed, stopping session");
                    self.shutdown("send failure");
                    break;
                }
                Err(err) => {
                    // One bad input never takes the call down
                    warn!(connection_id = %self.connection_id, error = %err, "Input dropped");
                }
            }
        }

        debug!(connection_id = %self.connection_id, turns = self.turn, "Session task finished");
    }

    fn handle_input(&mut self, input: SessionInput) -> Result<Flow, SessionError> {
        match input {
            SessionInput::Inbound(raw) => match decode(&raw) {
                Ok(event) => self.handle_event(event),
                Err(err) => {
                    error!(connection_id = %self.connection_id, error = %err, "❌ Invalid message from carrier");
                    self.report(RecordKind::Malformed, json!({ "error": err.to_string(), "bytes": raw.len() }));
                    Ok(Flow::Continue)
                }
            },
            SessionInput::SilenceElapsed { generation } => {
                self.on_silence(generation)?;
                Ok(Flow::Continue)
            }
            SessionInput::Close => {
                self.shutdown("connection closed");
                Ok(Flow::Stop)
            }
        }
    }

    /// Apply one decoded carrier event.
    pub(crate) fn handle_event(&mut self, event: InboundEvent) -> Result<Flow, SessionError> {
        if self.state == TurnState::Stopped {
            debug!(connection_id = %self.connection_id, event = %event.kind(), "Ignoring event after stop");
            return Ok(Flow::Stop);
        }

        match event {
            InboundEvent::Connected => {
                info!(connection_id = %self.connection_id, "🎉 Call connected");
                self.report(RecordKind::Connected, serde_json::Value::Null);
            }
            InboundEvent::Start(info) => self.on_start(info),
            InboundEvent::Media { stream_sid, sequence_number, frame } => {
                let details = json!({
                    "chunk": frame.chunk,
                    "timestamp": frame.timestamp,
                    "sequence_number": sequence_number,
                    "payload_bytes": frame.payload_len(),
                    "stream_sid": stream_sid,
                });
                self.on_media(frame, details)?;
            }
            InboundEvent::Dtmf { stream_sid, digit, duration } => {
                info!(connection_id = %self.connection_id, %digit, "🔢 DTMF received");
                self.report(RecordKind::Dtmf, json!({ "digit": digit, "duration": duration }));
                self.send(OutboundFrame::DtmfAck {
                    stream_sid: stream_sid.or_else(|| self.stream_sid.clone()),
                    digit,
                    duration,
                })?;
            }
            InboundEvent::Mark { stream_sid, name } => {
                info!(connection_id = %self.connection_id, mark = %name, "📍 Mark received");
                self.report(RecordKind::Mark, json!({ "name": name }));
                self.send(OutboundFrame::MarkAck {
                    stream_sid: stream_sid.or_else(|| self.stream_sid.clone()),
                    name,
                })?;
            }
            InboundEvent::Clear { stream_sid } => self.on_clear(stream_sid)?,
            InboundEvent::Stop { call_sid, account_sid, reason } => {
                info!(
                    connection_id = %self.connection_id,
                    reason = %reason.as_deref().unwrap_or("unknown"),
                    "🛑 Stream stopped by carrier"
                );
                self.report(
                    RecordKind::Stop,
                    json!({ "reason": reason, "call_sid": call_sid, "account_sid": account_sid }),
                );
                self.shutdown("stop event");
                return Ok(Flow::Stop);
            }
            InboundEvent::Unknown { event } => {
                warn!(
                    connection_id = %self.connection_id,
                    event = %event.as_deref().unwrap_or("<missing>"),
                    "❓ Unrecognized event"
                );
                self.report(RecordKind::Unknown, json!({ "event": event }));
            }
        }

        Ok(Flow::Continue)
    }

    fn on_start(&mut self, info: StartInfo) {
        if let Some(existing) = &self.stream_sid {
            // Identity is fixed by the first start event
            warn!(
                connection_id = %self.connection_id,
                current = %existing,
                received = %info.stream_sid,
                "Duplicate start event ignored"
            );
            self.report(RecordKind::Start, json!({ "ignored": true, "stream_sid": info.stream_sid }));
            return;
        }

        self.stream_sid = Some(info.stream_sid.clone());
        self.call_sid = info.call_sid.clone();

        info!(
            connection_id = %self.connection_id,
            stream_sid = %info.stream_sid,
            call_sid = %info.call_sid.as_deref().unwrap_or("N/A"),
            from = %info.from.as_deref().unwrap_or("N/A"),
            to = %info.to.as_deref().unwrap_or("N/A"),
            "🚀 Stream started"
        );
        self.report(
            RecordKind::Start,
            json!({
                "account_sid": info.account_sid,
                "from": info.from,
                "to": info.to,
                "media_format": info.media_format,
            }),
        );
    }

    fn on_media(&mut self, frame: AudioFrame, mut details: serde_json::Value) -> Result<(), SessionError> {
        let accepted = self.state == TurnState::Listening;
        details["accepted"] = json!(accepted);
        self.report(RecordKind::Media, details);

        if !accepted {
            debug!(
                connection_id = %self.connection_id,
                chunk = %frame.chunk_label(),
                state = %self.state,
                "Dropping frame outside a listening turn"
            );
            return Ok(());
        }

        if self.config.echo_mode == EchoMode::Immediate {
            return self.send(OutboundFrame::MediaEcho {
                stream_sid: self.stream_sid.clone(),
                frame,
            });
        }

        debug!(connection_id = %self.connection_id, chunk = %frame.chunk_label(), "🎧 Buffering frame");
        self.buffer.append(frame);
        self.arm_silence_timer();
        Ok(())
    }

    /// Restart the trailing-silence countdown from now.
    fn arm_silence_timer(&mut self) {
        let inbox = self.inbox.clone();
        self.timer.arm(self.config.silence_threshold(), move |generation| {
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(SessionInput::SilenceElapsed { generation });
            }
        });
    }

    fn on_silence(&mut self, generation: u64) -> Result<(), SessionError> {
        if !self.timer.take_fire(generation) {
            debug!(connection_id = %self.connection_id, generation, "Stale silence timer ignored");
            return Ok(());
        }

        if self.state != TurnState::Listening || self.buffer.is_empty() {
            return Ok(());
        }

        let payload_bytes = self.buffer.payload_bytes();
        let frames = self.buffer.drain_all();
        self.turn += 1;
        info!(
            connection_id = %self.connection_id,
            turn = self.turn,
            frames = frames.len(),
            payload_bytes,
            "🤔 Silence detected, replaying turn"
        );

        self.transition(TurnState::Speaking);
        self.playback = Some(Playback {
            turn: self.turn,
            total: frames.len(),
            frames: frames.into(),
            next_at: Instant::now(),
        });
        Ok(())
    }

    /// Emit the next frame of the current playback, or finish it.
    fn advance_playback(&mut self) -> Result<(), SessionError> {
        let Some(playback) = self.playback.as_mut() else {
            return Ok(());
        };

        let Some(frame) = playback.frames.pop_front() else {
            // The pause after the last frame has elapsed
            info!(connection_id = %self.connection_id, turn = playback.turn, "👂 Turn complete, listening");
            self.playback = None;
            self.transition(TurnState::Listening);
            return Ok(());
        };

        let position = playback.total - playback.frames.len();
        let total = playback.total;
        playback.next_at = Instant::now() + self.config.pacing();

        debug!(connection_id = %self.connection_id, position, total, "🔊 Echoing buffered frame");
        self.send(OutboundFrame::MediaEcho {
            stream_sid: self.stream_sid.clone(),
            frame,
        })
    }

    fn on_clear(&mut self, stream_sid: Option<String>) -> Result<(), SessionError> {
        self.report(RecordKind::Clear, serde_json::Value::Null);

        self.timer.cancel();

        // Without a playback the run loop has no frame deadline to wait on
        if let Some(playback) = self.playback.take() {
            info!(
                connection_id = %self.connection_id,
                turn = playback.turn,
                remaining = playback.frames.len(),
                "🛑 Clear interrupted playback"
            );
        }
        let discarded = self.buffer.clear();
        if discarded > 0 {
            info!(connection_id = %self.connection_id, discarded, "🧹 Clear dropped buffered audio");
        }

        self.transition(TurnState::Listening);

        self.send(OutboundFrame::ClearAck {
            stream_sid: self.stream_sid.clone().or(stream_sid),
        })
    }

    /// Release everything and enter the terminal state. Safe to call more than once.
    fn shutdown(&mut self, reason: &str) {
        self.timer.cancel();
        self.playback = None;
        self.buffer.clear();

        if self.state != TurnState::Stopped {
            self.transition(TurnState::Stopped);
            info!(connection_id = %self.connection_id, %reason, turns = self.turn, "🔚 Session closed");
            self.report(RecordKind::SessionClosed, json!({ "reason": reason, "turns": self.turn }));
        }
    }

    fn transition(&mut self, to: TurnState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(connection_id = %self.connection_id, %from, %to, "State transition");
        self.report(RecordKind::Transition, json!({ "from": from, "to": to, "turn": self.turn }));
    }

    fn send(&self, frame: OutboundFrame) -> Result<(), SessionError> {
        let kind = RecordKind::from(&frame);
        let details = match &frame {
            OutboundFrame::MediaEcho { frame, .. } => json!({ "chunk": frame.chunk }),
            OutboundFrame::DtmfAck { digit, duration, .. } => json!({ "digit": digit, "duration": duration }),
            OutboundFrame::MarkAck { name, .. } => json!({ "name": name }),
            OutboundFrame::ClearAck { .. } => serde_json::Value::Null,
        };

        self.sink.send_text(encode(&frame))?;

        debug!(connection_id = %self.connection_id, frame = frame.label(), "Frame sent");
        self.report(kind, details);
        Ok(())
    }

    fn report(&self, kind: RecordKind, details: serde_json::Value) {
        self.reporter.report(
            CallRecord::new(kind, self.connection_id.as_str())
                .identity(self.stream_sid.as_deref(), self.call_sid.as_deref())
                .details(details),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::tests::CollectingReporter;
    use crate::protocol::inbound::Scalar;
    use serde_json::Value;

    struct Harness {
        session: CallSession,
        outbound: mpsc::UnboundedReceiver<String>,
        reporter: CollectingReporter,
        _inbox: mpsc::UnboundedSender<SessionInput>,
        inbox_rx: mpsc::UnboundedReceiver<SessionInput>,
    }

    fn harness() -> Harness {
        let (tx, outbound) = mpsc::unbounded_channel::<String>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let reporter = CollectingReporter::default();
        let session = CallSession::new(
            "conn_test".to_string(),
            SessionConfig::default(),
            SilenceTimer::new(),
            Arc::new(tx),
            Arc::new(reporter.clone()),
            inbox_tx.downgrade(),
        );
        Harness { session, outbound, reporter, _inbox: inbox_tx, inbox_rx }
    }

    fn media(chunk: u64) -> InboundEvent {
        InboundEvent::Media {
            stream_sid: None,
            sequence_number: None,
            frame: AudioFrame {
                chunk: Some(Scalar::from(chunk)),
                timestamp: None,
                payload: format!("p{}", chunk),
                extra: Default::default(),
            },
        }
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_fire_starts_playback() {
        let mut h = harness();
        h.session.handle_event(media(1)).unwrap();
        h.session.handle_event(media(2)).unwrap();
        assert_eq!(h.session.buffer.len(), 2);

        let Some(SessionInput::SilenceElapsed { generation }) = h.inbox_rx.recv().await else {
            panic!("expected a silence fire");
        };
        h.session.handle_input(SessionInput::SilenceElapsed { generation }).unwrap();

        assert_eq!(h.session.state, TurnState::Speaking);
        assert_eq!(h.session.buffer.len(), 0);

        h.session.advance_playback().unwrap();
        h.session.advance_playback().unwrap();
        assert_eq!(h.session.state, TurnState::Speaking);
        h.session.advance_playback().unwrap();
        assert_eq!(h.session.state, TurnState::Listening);

        let chunks: Vec<Value> = sent(&mut h.outbound).into_iter().map(|f| f["media"]["chunk"].clone()).collect();
        assert_eq!(chunks, vec![Value::from(1), Value::from(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fire_is_ignored() {
        let mut h = harness();
        h.session.handle_event(media(1)).unwrap();
        let stale = h.session.timer.arm(std::time::Duration::from_secs(60), |_| {});
        h.session.arm_silence_timer();

        h.session.on_silence(stale).unwrap();
        assert_eq!(h.session.state, TurnState::Listening);
        assert_eq!(h.session.buffer.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_while_speaking_is_dropped() {
        let mut h = harness();
        h.session.handle_event(media(1)).unwrap();
        let Some(SessionInput::SilenceElapsed { generation }) = h.inbox_rx.recv().await else {
            panic!("expected a silence fire");
        };
        h.session.on_silence(generation).unwrap();
        assert_eq!(h.session.state, TurnState::Speaking);

        h.session.handle_event(media(9)).unwrap();
        assert_eq!(h.session.buffer.len(), 0);
        assert!(!h.session.timer.is_armed());

        let media_records: Vec<Value> = h
            .reporter
            .records()
            .into_iter()
            .filter(|r| r.kind == RecordKind::Media)
            .map(|r| r.details)
            .collect();
        assert_eq!(media_records.last().unwrap()["accepted"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_mid_playback_resets_to_listening() {
        let mut h = harness();
        for chunk in 1..=3 {
            h.session.handle_event(media(chunk)).unwrap();
        }
        let Some(SessionInput::SilenceElapsed { generation }) = h.inbox_rx.recv().await else {
            panic!("expected a silence fire");
        };
        h.session.on_silence(generation).unwrap();
        h.session.advance_playback().unwrap();

        h.session.handle_event(InboundEvent::Clear { stream_sid: None }).unwrap();
        assert_eq!(h.session.state, TurnState::Listening);
        assert!(h.session.playback.is_none());

        // Nothing left to play
        h.session.advance_playback().unwrap();

        let frames = sent(&mut h.outbound);
        let events: Vec<&str> = frames.iter().map(|f| f["event"].as_str().unwrap()).collect();
        assert_eq!(events, vec!["media", "clear"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_mode_echoes_without_buffering() {
        let mut h = harness();
        h.session.config.echo_mode = EchoMode::Immediate;
        h.session.handle_event(media(4)).unwrap();

        assert_eq!(h.session.buffer.len(), 0);
        assert!(!h.session.timer.is_armed());
        let frames = sent(&mut h.outbound);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["media"]["chunk"], 4);
    }

    #[tokio::test]
    async fn test_send_failure_surfaces_as_error() {
        let mut h = harness();
        drop(h.outbound);
        let result = h.session.handle_event(InboundEvent::Mark {
            stream_sid: None,
            name: "m".to_string(),
        });
        assert!(matches!(result, Err(SessionError::SendFailure(_))));
    }

    #[tokio::test]
    async fn test_start_identity_is_fixed_and_stamped_on_records() {
        let mut h = harness();
        let start = |sid: &str| {
            InboundEvent::Start(StartInfo {
                stream_sid: sid.to_string(),
                call_sid: Some("c1".to_string()),
                account_sid: None,
                from: None,
                to: None,
                media_format: None,
            })
        };
        h.session.handle_event(start("s1")).unwrap();
        h.session.handle_event(start("s2")).unwrap();
        assert_eq!(h.session.stream_sid.as_deref(), Some("s1"));

        h.session.handle_event(InboundEvent::Dtmf {
            stream_sid: None,
            digit: "3".to_string(),
            duration: None,
        }).unwrap();
        let ack: Value = serde_json::from_str(&h.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(ack["stream_sid"], "s1");

        let last = h.reporter.records().pop().unwrap();
        assert_eq!(last.kind, RecordKind::DtmfAck);
        assert_eq!(last.stream_sid.as_deref(), Some("s1"));
        assert_eq!(last.call_sid.as_deref(), Some("c1"));
    }
}
