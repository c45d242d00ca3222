// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! One live server-side endpoint of a machine stream connection.
//!
//! Every session owns a bounded outbound queue drained by a single writer
//! task, so all frames enqueued for a session reach the peer in enqueue
//! order. Lifecycle frames are essential and are never dropped; when the
//! queue is full the oldest broadcast snapshot is evicted instead.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use opentelemetry::KeyValue;
use orchard_api::{Envelope, MessageBody};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error};

use super::metrics::StreamMetrics;
use crate::auth::User;

/// Close code for connections that never presented a valid token.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;
/// Close code for authenticated users lacking the required capability.
pub const CLOSE_FORBIDDEN: u16 = 4403;
/// Close code for administrative disconnects.
pub const CLOSE_ADMINISTRATIVE: u16 = 4000;

/// Outbound frames buffered per session before broadcast eviction kicks in.
pub const SEND_QUEUE_CAPACITY: usize = 64;

/// Registry key of a session, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl SessionKey {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// The session is closed or closing; no further frames are accepted.
#[derive(Debug, Error)]
#[error("session is no longer send-capable")]
pub struct SessionClosed;

enum Frame {
    Payload { text: String, essential: bool },
    Close { code: u16, reason: String },
}

struct Queue {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Shared handle to one live session: the registry holds it for fan-out, the
/// endpoint handler holds it for its lifetime, and a writer task drains it.
pub struct SessionChannel {
    key: SessionKey,
    user: User,
    state: AtomicU8,
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
}

impl SessionChannel {
    /// Creates an open session channel. Sessions only exist once the
    /// transport is accepted and the user authorized, so the channel starts
    /// in the `Open` state.
    pub fn new(user: User, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            key: SessionKey::next(),
            user,
            state: AtomicU8::new(ConnectionState::Open as u8),
            queue: Mutex::new(Queue { frames: VecDeque::new(), closed: false }),
            notify: Notify::new(),
            capacity,
        })
    }

    pub const fn key(&self) -> SessionKey {
        self.key
    }

    pub const fn user(&self) -> &User {
        &self.user
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether broadcast passes may still hand frames to this session.
    pub fn is_send_capable(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queues one message for delivery. `essential` frames (lifecycle
    /// events) are never dropped; when the queue is full the oldest
    /// non-essential frame makes room, and a non-essential frame arriving
    /// at a queue full of essential frames is discarded.
    pub fn enqueue(&self, body: MessageBody, essential: bool) -> Result<(), SessionClosed> {
        if !self.is_send_capable() {
            return Err(SessionClosed);
        }

        let tag = body.tag();
        let envelope = Envelope::new(body);
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                error!(tag, error = %err, "Failed to serialize stream frame");
                return Ok(());
            },
        };

        let metrics = StreamMetrics::shared();
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return Err(SessionClosed);
            }

            if queue.frames.len() >= self.capacity {
                if let Some(index) = queue
                    .frames
                    .iter()
                    .position(|frame| matches!(frame, Frame::Payload { essential: false, .. }))
                {
                    let _evicted = queue.frames.remove(index);
                    metrics.dropped_counter.add(1, &[KeyValue::new("reason", "queue_full")]);
                    debug!(session = %self.key, "Send queue full, evicted oldest broadcast frame");
                } else if !essential {
                    metrics.dropped_counter.add(1, &[KeyValue::new("reason", "queue_full")]);
                    debug!(session = %self.key, tag, "Send queue full of lifecycle frames, dropping broadcast frame");
                    return Ok(());
                }
            }

            queue.frames.push_back(Frame::Payload { text, essential });
        }

        metrics.frames_counter.add(1, &[KeyValue::new("type", tag)]);
        self.notify.notify_one();
        Ok(())
    }

    /// Initiates a close handshake. Frames already queued are flushed first,
    /// then the close frame goes out and the writer stops. Idempotent.
    pub fn close(&self, code: u16, reason: &str) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        {
            let mut queue = self.queue.lock();
            if !queue.closed {
                queue.frames.push_back(Frame::Close { code, reason: reason.to_string() });
            }
        }
        self.notify.notify_one();
    }

    /// Marks the transport as gone. No handshake is attempted.
    pub fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }

    /// Drains the queue into the transport until the session closes or the
    /// peer goes away. Exactly one writer runs per session.
    pub async fn run_writer(self: Arc<Self>, mut sink: SplitSink<WebSocket, Message>) {
        loop {
            let frame = self.queue.lock().frames.pop_front();
            match frame {
                None => {
                    if self.state() == ConnectionState::Closed {
                        break;
                    }
                    self.notify.notified().await;
                },
                Some(Frame::Payload { text, .. }) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                },
                Some(Frame::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                },
            }
        }
        self.mark_closed();
    }

    #[cfg(test)]
    pub(crate) fn queued_texts(&self) -> Vec<String> {
        self.queue
            .lock()
            .frames
            .iter()
            .map(|frame| match frame {
                Frame::Payload { text, .. } => text.clone(),
                Frame::Close { .. } => String::new(),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn queued_types(&self) -> Vec<String> {
        self.queue
            .lock()
            .frames
            .iter()
            .map(|frame| match frame {
                Frame::Payload { text, .. } => serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|value| value["type"].as_str().map(ToString::to_string))
                    .unwrap_or_default(),
                Frame::Close { .. } => "CLOSE".to_string(),
            })
            .collect()
    }
}
