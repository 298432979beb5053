//! The session bus: a typed broadcast channel carrying every UI and
//! control message. Subscribers see messages on a channel in publish
//! order; request/response pairs use per-id channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

/// Built-in channels plus the per-request response channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Rendering: everything the client should print
    Default,

    InputRequest,
    InputResponse(u64),

    /// Loading-indicator on/off messages
    Loading,

    CompletionRequest,
    CompletionResponse(u64),

    /// Client-initiated cancellation of the current turn
    Interrupt,

    /// Ask the session to shut down
    SessionExit,

    /// Session is done; client may quit
    ClientExit,

    /// End-of-turn signal carrying whether edits were produced
    EditsComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Server,
    Client,
}

/// One bus message. `extra` carries rendering hints such as color.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: u64,
    pub channel: Channel,
    pub source: MessageSource,
    pub data: Value,
    pub extra: serde_json::Map<String, Value>,
}

impl StreamMessage {
    /// The payload as text, for the common string case.
    pub fn text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn color(&self) -> Option<&str> {
        self.extra.get("color").and_then(Value::as_str)
    }
}

/// A subscription pinned to one channel. Created before the triggering
/// send, so responses cannot be missed.
pub struct Listener {
    channel: Channel,
    rx: broadcast::Receiver<StreamMessage>,
}

impl Listener {
    /// Next message on this listener's channel, in publish order.
    /// Returns None when the bus closes.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.channel == self.channel => return Some(message),
                Ok(_) => continue,
                // A lagging subscriber resumes at the oldest retained
                // message rather than dying
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used at cancellation checkpoints.
    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) if message.channel == self.channel => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Cloneable handle to the session bus.
#[derive(Clone)]
pub struct SessionBus {
    tx: broadcast::Sender<StreamMessage>,
    next_id: Arc<AtomicU64>,
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish on a channel; returns the sent message (its id names the
    /// response channel for request/response flows).
    pub fn send(
        &self,
        data: impl Into<Value>,
        channel: Channel,
        source: MessageSource,
    ) -> StreamMessage {
        self.send_with(data, channel, source, serde_json::Map::new())
    }

    pub fn send_with(
        &self,
        data: impl Into<Value>,
        channel: Channel,
        source: MessageSource,
        extra: serde_json::Map<String, Value>,
    ) -> StreamMessage {
        let message = StreamMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            channel,
            source,
            data: data.into(),
            extra,
        };
        // No subscribers is fine; the message just evaporates
        let _ = self.tx.send(message.clone());
        message
    }

    /// Server-side rendering output.
    pub fn print(&self, text: impl Into<String>) {
        self.send(text.into(), Channel::Default, MessageSource::Server);
    }

    /// Rendering output with a color hint for the client.
    pub fn print_colored(&self, text: impl Into<String>, color: &str) {
        let mut extra = serde_json::Map::new();
        extra.insert("color".to_string(), Value::String(color.to_string()));
        self.send_with(text.into(), Channel::Default, MessageSource::Server, extra);
    }

    /// Subscribe to one channel. Always subscribe before sending the
    /// message that triggers a response on it.
    pub fn listen(&self, channel: Channel) -> Listener {
        Listener {
            channel,
            rx: self.tx.subscribe(),
        }
    }

    /// Publish a request and return a listener for its response channel.
    /// The subscription is created before the send, so a fast responder
    /// cannot slip a reply past us.
    pub fn request(
        &self,
        data: impl Into<Value>,
        channel: Channel,
        source: MessageSource,
        response_channel: impl FnOnce(u64) -> Channel,
    ) -> (StreamMessage, Listener) {
        let rx = self.tx.subscribe();
        let message = self.send(data, channel, source);
        let listener = Listener {
            channel: response_channel(message.id),
            rx,
        };
        (message, listener)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_channel_fifo_order() {
        let bus = SessionBus::new();
        let mut listener = bus.listen(Channel::Default);

        for i in 0..5 {
            bus.send(format!("m{i}"), Channel::Default, MessageSource::Server);
        }
        // Interleaved other-channel traffic is invisible to the listener
        bus.send("noise", Channel::Loading, MessageSource::Server);

        for i in 0..5 {
            let msg = listener.recv().await.unwrap();
            assert_eq!(msg.text(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn response_channel_roundtrip() {
        let bus = SessionBus::new();

        // Client answers any input request with "hello"
        let client_bus = bus.clone();
        let mut requests = bus.listen(Channel::InputRequest);
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            client_bus.send(
                "hello",
                Channel::InputResponse(request.id),
                MessageSource::Client,
            );
        });

        let request = bus.send("", Channel::InputRequest, MessageSource::Server);
        let mut responses = bus.listen(Channel::InputResponse(request.id));
        // Subscribe-before-send is the rule; here the listener exists
        // before the client can respond because the client reacts to the
        // request we just published.
        let response = responses.recv().await.unwrap();
        assert_eq!(response.text(), "hello");
        assert_eq!(response.source, MessageSource::Client);
    }

    #[tokio::test]
    async fn message_ids_are_unique() {
        let bus = SessionBus::new();
        let a = bus.send("a", Channel::Default, MessageSource::Server);
        let b = bus.send("b", Channel::Default, MessageSource::Server);
        assert_ne!(a.id, b.id);
    }
}
