//! Connection builder, send path and read loop.
//!
//! The [`ConnectionBuilder`] collects settings and the extensions the
//! application wants. [`ConnectionBuilder::connect`] then:
//! 1. Resolves the display name and opens the socket
//! 2. Performs the setup handshake
//! 3. Spawns the writer task and the read loop
//! 4. Queries every extension and freezes the dispatch table
//!
//! # Example
//!
//! ```ignore
//! use xwire::ext::damage::{Damage, ReportLevel};
//! use xwire::Connection;
//!
//! #[tokio::main]
//! async fn main() -> xwire::Result<()> {
//!     let conn = Connection::builder()
//!         .extension::<Damage>()
//!         .connect()
//!         .await?;
//!
//!     let damage = Damage::new(&conn)?;
//!     damage.query_version(1, 1).await?.reply().await?;
//!
//!     let id = conn.generate_id().await?;
//!     let root = conn.setup().roots[0].root;
//!     damage.create(id, root, ReportLevel::NonEmpty).await?.check().await?;
//!
//!     loop {
//!         let event = conn.wait_for_event().await?;
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cookie::{self, Cookie, Resolve, VoidCookie};
use crate::dispatch::{
    Deliver, DispatchTableBuilder, Dispatcher, Extension, ExtensionInfo, ExtensionTables,
    RoutingState, SEQUENCE_WINDOW,
};
use crate::error::{Result, XwireError};
use crate::event::{Event, ProtocolError};
use crate::ext::xc_misc::{GetXIDRange, XcMisc};
use crate::id::IdAllocator;
use crate::message::{decode_frame, encode_request, ReplyRequest, Request};
use crate::protocol::setup::{setup_response_len, SETUP_PREFIX_SIZE};
use crate::protocol::xproto::{
    GetInputFocus, GetInputFocusReply, QueryExtension, QueryExtensionReply,
};
use crate::protocol::{
    ByteOrder, FrameBuffer, Setup, SetupRequest, SetupResponse, DEFAULT_MAX_FRAME_SIZE,
};
use crate::transport::{DisplayName, XStream};
use crate::writer::{spawn_writer_task, OutboundRequest, WriterConfig, WriterHandle};

/// Requests sent without anything the server must answer before a
/// `GetInputFocus` round trip is slipped in.
const SYNC_INTERVAL: u64 = SEQUENCE_WINDOW / 2;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and opening a [`Connection`].
pub struct ConnectionBuilder {
    display: Option<DisplayName>,
    order: ByteOrder,
    auth_name: Vec<u8>,
    auth_data: Vec<u8>,
    writer_config: WriterConfig,
    max_frame_size: u64,
    reply_timeout: Option<Duration>,
    extensions: Vec<(ExtensionTables, bool)>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            display: None,
            order: ByteOrder::native(),
            auth_name: Vec::new(),
            auth_data: Vec::new(),
            writer_config: WriterConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reply_timeout: None,
            extensions: Vec::new(),
        }
    }

    /// Display to connect to. Default: the `DISPLAY` environment variable.
    pub fn display(mut self, display: DisplayName) -> Self {
        self.display = Some(display);
        self
    }

    /// Byte order to ask the server for. Default: native.
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    /// Authorization protocol name and data sent in the setup request,
    /// e.g. `MIT-MAGIC-COOKIE-1` and the 16-byte cookie.
    pub fn authorization(mut self, name: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) -> Self {
        self.auth_name = name.into();
        self.auth_data = data.into();
        self
    }

    /// Set the maximum queued requests for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Largest incoming frame accepted before the connection is dropped.
    ///
    /// Default: 256 MiB
    pub fn max_frame_size(mut self, max: u64) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Bound applied by [`Cookie::reply`]. Default: none.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// Register an extension the application cannot work without.
    /// Connecting fails if the server lacks it.
    pub fn extension<E: Extension>(self) -> Self {
        self.add_extension(ExtensionTables::of::<E>(), true)
    }

    /// Register an extension that is used when the server has it.
    pub fn optional_extension<E: Extension>(self) -> Self {
        self.add_extension(ExtensionTables::of::<E>(), false)
    }

    fn add_extension(mut self, tables: ExtensionTables, required: bool) -> Self {
        match self
            .extensions
            .iter_mut()
            .find(|(existing, _)| existing.name == tables.name)
        {
            Some((_, existing_required)) => *existing_required |= required,
            None => self.extensions.push((tables, required)),
        }
        self
    }

    /// Connect to the configured display.
    pub async fn connect(self) -> Result<Connection> {
        let display = match &self.display {
            Some(display) => display.clone(),
            None => DisplayName::from_env()?,
        };
        let endpoint = display.endpoint()?;
        let stream = XStream::connect(&endpoint).await?;
        self.establish(stream).await
    }

    /// Run the connection over an already open stream.
    pub async fn establish<S>(self, stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut write_half) = tokio::io::split(stream);
        let order = self.order;

        let setup = handshake(
            &mut reader,
            &mut write_half,
            SetupRequest::new(order, self.auth_name, self.auth_data),
        )
        .await?;

        tracing::debug!(
            vendor = %setup.vendor,
            release = setup.release_number,
            max_request_units = setup.maximum_request_length,
            "connection established"
        );

        let routing = Arc::new(RoutingState::default());

        let (writer, writer_task) = spawn_writer_task(write_half, self.writer_config);
        let writer_state = routing.clone();
        let writer_task = tokio::spawn(async move {
            let result = match writer_task.await {
                Ok(result) => result,
                Err(e) => Err(XwireError::Io(std::io::Error::other(e))),
            };
            if result.is_err() {
                // Nothing queued behind the failed write will be answered.
                writer_state.pending.fail_all();
            }
            result
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let sink = ChannelSink {
            events: event_tx,
            errors: error_tx,
        };

        let loop_state = routing.clone();
        let max_frame_size = self.max_frame_size;
        let read_task = tokio::spawn(async move {
            let result = read_loop(reader, order, max_frame_size, &loop_state, sink).await;
            match &result {
                Ok(()) => tracing::debug!("server closed the connection"),
                Err(e) => tracing::error!(error = %e, "read loop failed"),
            }
            loop_state.pending.fail_all();
            result
        });

        let ids = IdAllocator::new(setup.resource_id_base, setup.resource_id_mask);
        let connection = Connection {
            inner: Arc::new(Inner {
                order,
                max_request_units: setup.maximum_request_length,
                setup,
                routing,
                writer,
                send: Mutex::new(SendState::default()),
                ids: Mutex::new(ids),
                events: Mutex::new(event_rx),
                errors: Mutex::new(error_rx),
                reply_timeout: self.reply_timeout,
                read_task,
                _writer_task: writer_task,
            }),
        };

        connection.register_extensions(&self.extensions).await?;
        Ok(connection)
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn handshake<R, W>(reader: &mut R, writer: &mut W, request: SetupRequest) -> Result<Setup>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let order = request.order;
    writer.write_all(&request.encode()?).await?;
    writer.flush().await?;

    let mut prefix = [0u8; SETUP_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let total = setup_response_len(&prefix, order)?;

    let mut response = vec![0u8; total];
    response[..SETUP_PREFIX_SIZE].copy_from_slice(&prefix);
    reader.read_exact(&mut response[SETUP_PREFIX_SIZE..]).await?;

    match SetupResponse::decode(&response, order)? {
        SetupResponse::Success(setup) => Ok(setup),
        SetupResponse::Failed { reason, .. } => {
            tracing::warn!(%reason, "server refused the connection");
            Err(XwireError::SetupFailed { reason })
        }
        SetupResponse::Authenticate { reason } => Err(XwireError::SetupAuthenticate { reason }),
    }
}

/// Feeds socket bytes through the frame buffer into the dispatcher.
async fn read_loop<R>(
    mut reader: R,
    order: ByteOrder,
    max_frame_size: u64,
    routing: &RoutingState,
    sink: ChannelSink,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_frame_size(order, max_frame_size);
    let dispatcher = Dispatcher::new(order, routing, &sink);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(XwireError::Io(e)),
        };

        for frame in frames.push(&buf[..n])? {
            dispatcher.dispatch(frame)?;
        }
    }
}

/// Hands undeliverable frames to the application's event and error queues.
struct ChannelSink {
    events: mpsc::UnboundedSender<Event>,
    errors: mpsc::UnboundedSender<ProtocolError>,
}

impl Deliver for ChannelSink {
    fn deliver_event(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::trace!("event dropped, connection handle gone");
        }
    }

    fn deliver_error(&self, error: ProtocolError) {
        if self.errors.send(error).is_err() {
            tracing::trace!("error dropped, connection handle gone");
        }
    }
}

#[derive(Default)]
struct SendState {
    /// Sequence of the last request handed to the writer.
    last: u64,
    /// Newest request the server is bound to reply to.
    reply_due: u64,
}

struct Inner {
    order: ByteOrder,
    max_request_units: u16,
    setup: Setup,
    routing: Arc<RoutingState>,
    writer: WriterHandle,
    /// Held while a request is numbered, registered and queued.
    send: Mutex<SendState>,
    ids: Mutex<IdAllocator>,
    events: Mutex<mpsc::UnboundedReceiver<Event>>,
    errors: Mutex<mpsc::UnboundedReceiver<ProtocolError>>,
    reply_timeout: Option<Duration>,
    read_task: JoinHandle<Result<()>>,
    _writer_task: JoinHandle<Result<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

/// An open connection. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// What the server sent during setup.
    pub fn setup(&self) -> &Setup {
        &self.inner.setup
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.inner.order
    }

    /// Opcode and code bases of a registered extension.
    pub fn extension_info(&self, name: &str) -> Option<ExtensionInfo> {
        self.inner.routing.tables()?.extension(name).copied()
    }

    /// # Errors
    ///
    /// [`XwireError::ExtensionNotRegistered`] if `E` was not registered on
    /// the builder or the server does not have it.
    pub fn extension<E: Extension>(&self) -> Result<ExtensionInfo> {
        self.extension_info(E::NAME)
            .ok_or(XwireError::ExtensionNotRegistered(E::NAME))
    }

    /// Send a request the server replies to.
    ///
    /// `ext` is `None` for core requests.
    pub async fn send_with_reply<R: ReplyRequest>(
        &self,
        ext: Option<&ExtensionInfo>,
        request: &R,
    ) -> Result<Cookie<R::Reply>> {
        let bytes = self.encode(ext, request)?;
        let order = self.inner.order;
        let timeout = self.inner.reply_timeout;
        let connection = self.clone();
        self.submit(R::NAME, bytes, |sequence| {
            let (cookie, slot) =
                cookie::issue(sequence, order, decode_frame::<R::Reply>, timeout);
            (
                cookie.with_connection(connection),
                Some(Box::new(slot) as Box<dyn Resolve>),
            )
        })
        .await
    }

    /// Send a request without a reply and keep a handle on its outcome.
    pub async fn send_checked<R: Request>(
        &self,
        ext: Option<&ExtensionInfo>,
        request: &R,
    ) -> Result<VoidCookie> {
        let bytes = self.encode(ext, request)?;
        let connection = self.clone();
        self.submit(R::NAME, bytes, |sequence| {
            let (cookie, slot) = cookie::issue_void(sequence, connection);
            (cookie, Some(Box::new(slot) as Box<dyn Resolve>))
        })
        .await
    }

    /// Send a request without a reply. Errors it causes arrive through
    /// [`wait_for_error`](Self::wait_for_error).
    pub async fn send_unchecked<R: Request>(
        &self,
        ext: Option<&ExtensionInfo>,
        request: &R,
    ) -> Result<u64> {
        let bytes = self.encode(ext, request)?;
        self.submit(R::NAME, bytes, |sequence| (sequence, None))
            .await
    }

    /// Send an already encoded request that has no reply.
    pub async fn send_noreply(&self, bytes: Bytes) -> Result<u64> {
        self.submit("raw", bytes, |sequence| (sequence, None)).await
    }

    fn encode<R: Request>(&self, ext: Option<&ExtensionInfo>, request: &R) -> Result<Bytes> {
        Ok(encode_request(
            request,
            ext.map(|info| info.major_opcode),
            self.inner.order,
            self.inner.max_request_units,
        )?)
    }

    /// Number, register and queue one request.
    ///
    /// After [`SYNC_INTERVAL`] requests that the server need not answer, a
    /// `GetInputFocus` goes out first so replies keep advancing the window.
    async fn submit<T>(
        &self,
        name: &'static str,
        bytes: Bytes,
        issue: impl FnOnce(u64) -> (T, Option<Box<dyn Resolve>>),
    ) -> Result<T> {
        let mut send = self.inner.send.lock().await;

        let quiet_since = send.reply_due.max(self.inner.routing.last_answered());
        if (send.last + 1).saturating_sub(quiet_since) >= SYNC_INTERVAL {
            let sync = self.encode(None, &GetInputFocus)?;
            let order = self.inner.order;
            self.enqueue(&mut send, "GetInputFocus", sync, |sequence| {
                let (_, slot) =
                    cookie::issue(sequence, order, decode_frame::<GetInputFocusReply>, None);
                ((), Some(Box::new(slot) as Box<dyn Resolve>))
            })
            .await?;
            tracing::debug!(sequence = send.last, "inserted sync");
        }

        self.enqueue(&mut send, name, bytes, issue).await
    }

    async fn enqueue<T>(
        &self,
        send: &mut SendState,
        name: &'static str,
        bytes: Bytes,
        issue: impl FnOnce(u64) -> (T, Option<Box<dyn Resolve>>),
    ) -> Result<T> {
        let routing = &self.inner.routing;
        let sequence = send.last + 1;
        routing.check_window(sequence)?;

        let (handle, slot) = issue(sequence);
        let tracked = slot.is_some();
        let reply_due = slot.as_ref().is_some_and(|slot| slot.expects_reply());
        if let Some(slot) = slot {
            routing.pending.insert(slot)?;
        }

        // Published before the bytes can reach the server, so the read loop
        // can always widen the answer.
        routing.last_sent.store(sequence, Ordering::Release);
        if let Err(e) = self
            .inner
            .writer
            .send(OutboundRequest::new(sequence, bytes))
            .await
        {
            routing.last_sent.store(send.last, Ordering::Release);
            if tracked {
                routing.pending.take(sequence);
            }
            return Err(e);
        }

        send.last = sequence;
        if reply_due {
            send.reply_due = sequence;
        }
        tracing::trace!(sequence, request = name, "queued request");
        Ok(handle)
    }

    /// Ask the server about an extension.
    pub async fn query_extension(&self, name: &str) -> Result<QueryExtensionReply> {
        self.send_with_reply(None, &QueryExtension::new(name))
            .await?
            .reply()
            .await
    }

    async fn register_extensions(&self, wanted: &[(ExtensionTables, bool)]) -> Result<()> {
        let mut cookies = Vec::with_capacity(wanted.len());
        for (tables, _) in wanted {
            cookies.push(
                self.send_with_reply(None, &QueryExtension::new(tables.name))
                    .await?,
            );
        }

        let mut builder = DispatchTableBuilder::new();
        for ((tables, required), cookie) in wanted.iter().zip(cookies) {
            let reply = cookie.reply().await?;
            if !reply.present {
                if *required {
                    return Err(XwireError::ExtensionNotPresent(tables.name.to_string()));
                }
                tracing::debug!(extension = tables.name, "optional extension not present");
                continue;
            }
            let info = ExtensionInfo {
                name: tables.name,
                major_opcode: reply.major_opcode,
                first_event: reply.first_event,
                first_error: reply.first_error,
            };
            builder.register(info, *tables)?;
        }

        // Nothing else sets the table, so this cannot fail.
        let _ = self.inner.routing.tables.set(builder.build());
        Ok(())
    }

    /// Round trip: returns once the server has processed every request sent
    /// before it.
    pub async fn sync(&self) -> Result<()> {
        self.send_with_reply(None, &GetInputFocus)
            .await?
            .reply()
            .await
            .map(|_| ())
    }

    /// Allocate a resource id.
    ///
    /// When the range handed out at setup is used up, asks XC-MISC for
    /// another one.
    ///
    /// # Errors
    ///
    /// [`XwireError::IdsExhausted`] if the server has no XC-MISC or no free
    /// ids.
    pub async fn generate_id(&self) -> Result<u32> {
        let mut ids = self.inner.ids.lock().await;
        if let Some(id) = ids.next_id() {
            return Ok(id);
        }

        let info = match self.extension_info(XcMisc::NAME) {
            Some(info) => info,
            None => {
                let reply = self.query_extension(XcMisc::NAME).await?;
                if !reply.present {
                    return Err(XwireError::IdsExhausted);
                }
                ExtensionInfo {
                    name: XcMisc::NAME,
                    major_opcode: reply.major_opcode,
                    first_event: reply.first_event,
                    first_error: reply.first_error,
                }
            }
        };

        let range = self
            .send_with_reply(Some(&info), &GetXIDRange)
            .await?
            .reply()
            .await?;
        ids.refill(range.start_id, range.count)?;
        ids.next_id().ok_or(XwireError::IdsExhausted)
    }

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// [`XwireError::ConnectionClosed`] once the read loop has stopped and
    /// every queued event has been taken.
    pub async fn wait_for_event(&self) -> Result<Event> {
        self.inner
            .events
            .lock()
            .await
            .recv()
            .await
            .ok_or(XwireError::ConnectionClosed)
    }

    /// Take the next event if one is queued.
    pub fn poll_for_event(&self) -> Result<Option<Event>> {
        let Ok(mut events) = self.inner.events.try_lock() else {
            return Ok(None);
        };
        poll(&mut events)
    }

    /// Wait for the next error that no cookie claimed.
    pub async fn wait_for_error(&self) -> Result<ProtocolError> {
        self.inner
            .errors
            .lock()
            .await
            .recv()
            .await
            .ok_or(XwireError::ConnectionClosed)
    }

    pub fn poll_for_error(&self) -> Result<Option<ProtocolError>> {
        let Ok(mut errors) = self.inner.errors.try_lock() else {
            return Ok(None);
        };
        poll(&mut errors)
    }

    /// Requests still waiting for a reply or an outcome.
    pub fn pending_replies(&self) -> usize {
        self.inner.routing.pending.len()
    }

    /// Whether the read loop or the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.routing.pending.is_closed() || self.inner.writer.is_closed()
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.inner.writer.is_backpressure_active()
    }

    /// Requests queued but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.inner.writer.pending_count()
    }
}

fn poll<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Result<Option<T>> {
    match rx.try_recv() {
        Ok(item) => Ok(Some(item)),
        Err(TryRecvError::Empty) => Ok(None),
        Err(TryRecvError::Disconnected) => Err(XwireError::ConnectionClosed),
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("order", &self.inner.order)
            .field("vendor", &self.inner.setup.vendor)
            .field("pending_replies", &self.pending_replies())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::damage::Damage;
    use crate::message::decode_request;
    use crate::protocol::setup::encode_setup_failed;
    use crate::protocol::setup::tests::sample_setup;
    use crate::protocol::{encode_reply_frame, RequestHeader, REQUEST_HEADER_SIZE};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    const LE: ByteOrder = ByteOrder::Little;

    /// Read one request from the client side of a duplex pipe.
    async fn read_request(server: &mut DuplexStream) -> Vec<u8> {
        let mut header = [0u8; REQUEST_HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        let len = RequestHeader::decode(&header, LE).unwrap().byte_len();
        let mut bytes = header.to_vec();
        bytes.resize(len, 0);
        server
            .read_exact(&mut bytes[REQUEST_HEADER_SIZE..])
            .await
            .unwrap();
        bytes
    }

    async fn accept(server: &mut DuplexStream, setup: &Setup) {
        let mut request = [0u8; 12];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(request[0], b'l');
        server.write_all(&setup.encode(LE).unwrap()).await.unwrap();
    }

    /// Passes reads through and fails every write once `broken` is set.
    struct BreakableWrites {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl AsyncRead for BreakableWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BreakableWrites {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.broken.load(Ordering::Acquire) {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Connection::builder()
            .byte_order(ByteOrder::Big)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10))
            .reply_timeout(Duration::from_secs(2))
            .max_frame_size(1 << 20);

        assert_eq!(builder.order, ByteOrder::Big);
        assert_eq!(builder.writer_config.max_pending_frames, 2048);
        assert_eq!(builder.writer_config.channel_capacity, 512);
        assert_eq!(
            builder.writer_config.backpressure_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(builder.reply_timeout, Some(Duration::from_secs(2)));
        assert_eq!(builder.max_frame_size, 1 << 20);
    }

    #[test]
    fn test_builder_extension_dedup() {
        let builder = Connection::builder()
            .optional_extension::<Damage>()
            .extension::<Damage>()
            .optional_extension::<XcMisc>();

        assert_eq!(builder.extensions.len(), 2);
        assert_eq!(builder.extensions[0].0.name, "DAMAGE");
        assert!(builder.extensions[0].1, "required wins");
        assert!(!builder.extensions[1].1);
    }

    #[tokio::test]
    async fn test_setup_refused() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut request = [0u8; 12];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&encode_setup_failed(LE, "No protocol specified"))
                .await
                .unwrap();
            server
        });

        let err = Connection::builder()
            .byte_order(LE)
            .establish(client)
            .await
            .unwrap_err();
        match err {
            XwireError::SetupFailed { reason } => assert_eq!(reason, "No protocol specified"),
            other => panic!("unexpected error: {other}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_and_sync() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let setup = sample_setup();
        let expected = setup.clone();

        let server_task = tokio::spawn(async move {
            accept(&mut server, &setup).await;
            let request = read_request(&mut server).await;
            assert_eq!(request, [43, 0, 1, 0]);
            let mut body = Vec::new();
            body.extend_from_slice(&0x3a5u32.to_le_bytes());
            server
                .write_all(&encode_reply_frame(LE, 1, 1, &body))
                .await
                .unwrap();
            server
        });

        let conn = Connection::builder()
            .byte_order(LE)
            .establish(client)
            .await
            .unwrap();
        assert_eq!(conn.setup(), &expected);
        conn.sync().await.unwrap();
        assert_eq!(conn.pending_replies(), 0);
        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_required_extension() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let setup = sample_setup();

        let server_task = tokio::spawn(async move {
            accept(&mut server, &setup).await;
            let request = read_request(&mut server).await;
            let query: QueryExtension = decode_request(&request, None, LE).unwrap();
            assert_eq!(query.name, b"DAMAGE");
            server
                .write_all(&encode_reply_frame(LE, 0, 1, &[0, 0, 0, 0]))
                .await
                .unwrap();
            server
        });

        let err = Connection::builder()
            .byte_order(LE)
            .extension::<Damage>()
            .establish(client)
            .await
            .unwrap_err();
        assert!(matches!(err, XwireError::ExtensionNotPresent(name) if name == "DAMAGE"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_optional_extension_absent() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let setup = sample_setup();

        let server_task = tokio::spawn(async move {
            accept(&mut server, &setup).await;
            read_request(&mut server).await;
            server
                .write_all(&encode_reply_frame(LE, 0, 1, &[0, 0, 0, 0]))
                .await
                .unwrap();
            server
        });

        let conn = Connection::builder()
            .byte_order(LE)
            .optional_extension::<Damage>()
            .establish(client)
            .await
            .unwrap();
        assert!(conn.extension_info("DAMAGE").is_none());
        assert!(matches!(
            Damage::new(&conn),
            Err(XwireError::ExtensionNotRegistered("DAMAGE"))
        ));
        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_ids_from_setup_range() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let setup = sample_setup();

        let server_task = tokio::spawn(async move {
            accept(&mut server, &setup).await;
            server
        });

        let conn = Connection::builder()
            .byte_order(LE)
            .establish(client)
            .await
            .unwrap();
        assert_eq!(conn.generate_id().await.unwrap(), 0x0420_0001);
        assert_eq!(conn.generate_id().await.unwrap(), 0x0420_0002);
        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_eof_fails_pending() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let setup = sample_setup();

        let conn = {
            let server_task = tokio::spawn(async move {
                accept(&mut server, &setup).await;
                server
            });
            let conn = Connection::builder()
                .byte_order(LE)
                .establish(client)
                .await
                .unwrap();
            let server = server_task.await.unwrap();
            let cookie = conn.send_with_reply(None, &GetInputFocus).await.unwrap();
            drop(server);
            assert!(matches!(
                cookie.reply().await,
                Err(XwireError::ConnectionClosed)
            ));
            conn
        };

        assert!(matches!(
            conn.wait_for_event().await,
            Err(XwireError::ConnectionClosed)
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_with_reply(None, &GetInputFocus).await,
            Err(XwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_failure_fails_pending() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let broken = Arc::new(AtomicBool::new(false));
        let client = BreakableWrites {
            inner: client,
            broken: broken.clone(),
        };
        let setup = sample_setup();

        let server_task = tokio::spawn(async move {
            accept(&mut server, &setup).await;
            server
        });
        let conn = Connection::builder()
            .byte_order(LE)
            .establish(client)
            .await
            .unwrap();
        let _server = server_task.await.unwrap();

        broken.store(true, Ordering::Release);
        let cookie = conn.send_with_reply(None, &GetInputFocus).await.unwrap();
        assert!(matches!(
            cookie.reply().await,
            Err(XwireError::ConnectionClosed)
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_with_reply(None, &GetInputFocus).await,
            Err(XwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_cookie_outlives_connection_handle() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let setup = sample_setup();

        let server_task = tokio::spawn(async move {
            accept(&mut server, &setup).await;
            server
        });
        let conn = Connection::builder()
            .byte_order(LE)
            .establish(client)
            .await
            .unwrap();
        let mut server = server_task.await.unwrap();

        let cookie = conn.send_with_reply(None, &GetInputFocus).await.unwrap();
        drop(conn);

        assert_eq!(read_request(&mut server).await, [43, 0, 1, 0]);
        server
            .write_all(&encode_reply_frame(LE, 1, 1, &0x3a5u32.to_le_bytes()))
            .await
            .unwrap();
        let reply = cookie.reply().await.unwrap();
        assert_eq!(reply.focus, 0x3a5);
    }

    #[tokio::test]
    async fn test_unanswered_run_gets_syncs_then_refuses() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let setup = sample_setup();

        // Reads everything the client can send and never answers.
        let server_task = tokio::spawn(async move {
            accept(&mut server, &setup).await;
            let mut syncs = Vec::new();
            for sequence in 1..=SEQUENCE_WINDOW {
                if read_request(&mut server).await[0] == 43 {
                    syncs.push(sequence);
                }
            }
            (server, syncs)
        });
        let conn = Connection::builder()
            .byte_order(LE)
            .establish(client)
            .await
            .unwrap();

        let no_operation = Bytes::from_static(&[127, 0, 1, 0]);
        let mut sent = 0u64;
        let err = loop {
            match conn.send_noreply(no_operation.clone()).await {
                Ok(_) => sent += 1,
                Err(e) => break e,
            }
        };

        assert!(matches!(
            err,
            XwireError::SequenceWindowExhausted { oldest: 1, next } if next == SEQUENCE_WINDOW + 1
        ));
        assert_eq!(sent, SEQUENCE_WINDOW - 2);
        let (_server, syncs) = server_task.await.unwrap();
        assert_eq!(syncs, [SYNC_INTERVAL, SEQUENCE_WINDOW]);
    }
}
