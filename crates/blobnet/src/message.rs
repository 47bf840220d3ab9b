use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::buffer::ByteBuffer;

/// Distinct failure kinds observed over a message's lifetime. Bits are only
/// ever set, never cleared: after retries the mask records every kind
/// encountered, not just the last one.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureCode(u16);

impl FailureCode {
    pub const SOCKET_CREATE: FailureCode = FailureCode(1 << 0);
    pub const CONNECT_TIMEOUT: FailureCode = FailureCode(1 << 1);
    pub const SEND: FailureCode = FailureCode(1 << 2);
    pub const RECV: FailureCode = FailureCode(1 << 3);
    pub const EMPTY: FailureCode = FailureCode(1 << 4);
    pub const HTTP_PROTOCOL: FailureCode = FailureCode(1 << 5);
    pub const TLS: FailureCode = FailureCode(1 << 6);
    pub const TIMEOUT: FailureCode = FailureCode(1 << 7);
    pub const RETRY_EXHAUSTED: FailureCode = FailureCode(1 << 8);

    pub fn none() -> Self {
        FailureCode(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: FailureCode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FailureCode) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl std::ops::BitOrAssign for FailureCode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(u16, &str); 9] = [
            (1 << 0, "SocketCreate"),
            (1 << 1, "ConnectTimeout"),
            (1 << 2, "Send"),
            (1 << 3, "Recv"),
            (1 << 4, "Empty"),
            (1 << 5, "HttpProtocol"),
            (1 << 6, "Tls"),
            (1 << 7, "Timeout"),
            (1 << 8, "RetryExhausted"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("None")?;
        }
        Ok(())
    }
}

/// Lifecycle of a message. Monotonic except on retry-reset, which returns
/// to Init. The TLS states only occur for HTTPS exchanges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    Init,
    InitSending,
    Sending,
    InitReceiving,
    Receiving,
    TlsHandshake,
    TlsShutdown,
    Finished,
    Aborted,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Finished | MessageState::Aborted)
    }
}

/// The response side of a message: the raw bytes as received, the body
/// window within them, and the terminal state.
#[derive(Debug, Default)]
pub struct MessageResult {
    pub(crate) data: ByteBuffer,
    pub(crate) size: u64,
    pub(crate) offset: u64,
    pub(crate) failure: FailureCode,
    pub(crate) state: StateCell,
}

/// Plain state holder; a dedicated type keeps Default derivable.
#[derive(Debug)]
pub(crate) struct StateCell(pub MessageState);

impl Default for StateCell {
    fn default() -> Self {
        StateCell(MessageState::Init)
    }
}

impl MessageResult {
    pub(crate) fn with_receive_buffer(storage: Vec<u8>) -> Self {
        MessageResult {
            data: ByteBuffer::fixed(storage),
            ..Default::default()
        }
    }

    /// The response body: everything past the transfer header.
    pub fn body(&self) -> &[u8] {
        let start = self.offset as usize;
        &self.data.data()[start..start + self.size as usize]
    }

    /// The full received bytes, header included.
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Body length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Body offset within `data()` (the header length).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn state(&self) -> MessageState {
        self.state.0
    }

    pub fn failure_code(&self) -> FailureCode {
        self.failure
    }

    pub fn success(&self) -> bool {
        self.state.0 == MessageState::Finished
    }

    /// Whether the buffer storage belongs to this result (as opposed to a
    /// caller-supplied receive buffer).
    pub fn owned(&self) -> bool {
        self.data.owned()
    }

    /// Move the buffer out, e.g. to retain it past delivery or to recycle.
    pub fn take_buffer(&mut self) -> ByteBuffer {
        std::mem::take(&mut self.data)
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut ByteBuffer {
        &mut self.data
    }

    /// Downgrade a delivered result to a protocol failure, e.g. when a
    /// multipart answer is missing its UploadId or ETag.
    pub(crate) fn mark_protocol_failure(&mut self) {
        self.failure.insert(FailureCode::HTTP_PROTOCOL);
        self.state.0 = MessageState::Aborted;
    }
}

/// Callback invoked exactly once when the message reaches a terminal state.
/// Messages cross thread boundaries through the group's queues and maps, so
/// callbacks carry Send + Sync.
pub type MessageCallback = Box<dyn FnOnce(&mut MessageResult) + Send + Sync>;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// The caller-visible request descriptor: pre-serialized request header
/// bytes, an optional PUT body, the destination, and the eventual result.
pub struct OriginalMessage {
    /// Unique per process; the key under which a finished message without a
    /// callback is handed back.
    pub id: u64,
    /// The serialized request header (and inline body for small requests).
    pub message: ByteBuffer,
    pub hostname: String,
    pub port: u16,
    pub tls: bool,
    /// Borrowed PUT body, sent after `message` without copying.
    pub put_body: Option<Bytes>,
    pub trace_id: u64,
    pub result: MessageResult,
    callback: Option<MessageCallback>,
}

impl OriginalMessage {
    pub fn new(message: ByteBuffer, hostname: impl Into<String>, port: u16, tls: bool) -> Self {
        OriginalMessage {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            message,
            hostname: hostname.into(),
            port,
            tls,
            put_body: None,
            trace_id: 0,
            result: MessageResult::default(),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: MessageCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_put_body(mut self, body: Bytes) -> Self {
        self.put_body = Some(body);
        self
    }

    /// Receive into caller-supplied storage instead of an engine buffer.
    pub fn with_receive_buffer(mut self, storage: Vec<u8>) -> Self {
        self.result = MessageResult::with_receive_buffer(storage);
        self
    }

    pub fn with_trace_id(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Attach a recycled buffer when the result has no storage yet.
    pub(crate) fn adopt_buffer(&mut self, buffer: ByteBuffer) {
        if self.result.data.capacity() == 0 {
            self.result.data = buffer;
            self.result.data.clear();
        }
    }

    pub fn put_length(&self) -> usize {
        self.put_body.as_ref().map_or(0, |b| b.len())
    }

    pub fn requires_finish(&self) -> bool {
        self.callback.is_some()
    }

    /// Invoke the callback; at most once per message.
    pub fn finish(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(&mut self.result);
        }
    }
}

impl std::fmt::Debug for OriginalMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginalMessage")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("request_bytes", &self.message.size())
            .field("put_length", &self.put_length())
            .field("state", &self.result.state())
            .finish()
    }
}
