//! Client builder and runtime loop.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the
//! connection. The [`Client`] manages the lifecycle:
//! 1. Connect the TCP socket and run the COTP and S7 setup
//! 2. Spawn the writer task and the receive task
//! 3. Correlate responses to requests and fan indications out
//! 4. Reconnect in the background after an unexpected drop
//!
//! # Example
//!
//! ```ignore
//! use s7wire_client::codec::read_write::{Area, ItemAddress};
//! use s7wire_client::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .rack(0)
//!         .slot(2)
//!         .open("192.168.0.10")
//!         .await?;
//!
//!     let values = client
//!         .read(vec![ItemAddress::bytes(Area::DataBlock, 1, 0, 4)])
//!         .await?;
//!     println!("DB1.DBD0 = {:02X?}", &values[0][..]);
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::alarms::{
    decode_alarm_listing, listing_total_length, AlarmUpdateRequest, PendingAlarmsAck,
    PendingAlarmsRequest, PlcAlarm,
};
use crate::codec::read_write::{ItemAddress, ReadRequest, WriteItem, WriteRequest, MAX_ITEMS};
use crate::codec::setup::CommunicationSetup;
use crate::codec::{decode, encode, Datagram, MessageKind, Request};
use crate::config::{ClientConfig, ConnectionType};
use crate::connection::{ConnectionState, Lifecycle, Session};
use crate::control::{negotiate, ConnectionRequest};
use crate::correlation::PendingRequest;
use crate::error::{Result, S7Error};
use crate::gate::{AdmissionGate, AdmissionPermit};
use crate::protocol::{BufferPool, Frame, FrameReader, ISO_HEADER_SIZE};
use crate::reassembly::FragmentAccumulator;
use crate::reference::ReferenceAllocator;
use crate::subscription::AlarmSubscription;
use crate::transport::{Endpoint, TcpTransport, TransportOptions};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Builder for configuring and creating a client.
///
/// Use the fluent API to set connection parameters, then call `open()` to
/// connect, or `build()` to get an unconnected client.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Set the PLC host name or address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the TCP port.
    ///
    /// Default: 102
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.config.connection_type = connection_type;
        self
    }

    pub fn rack(mut self, rack: u16) -> Self {
        self.config.rack = rack;
        self
    }

    pub fn slot(mut self, slot: u16) -> Self {
        self.config.slot = slot;
        self
    }

    /// Set the timeout for connecting and the connection setup.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    /// Set the timeout of a single request.
    ///
    /// Default: 5 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = millis(timeout);
        self
    }

    /// Reconnect in the background after an unexpected drop.
    ///
    /// Default: true
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Set the delay between reconnect attempts.
    ///
    /// Default: 500 ms
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval_ms = millis(interval);
        self
    }

    /// Enable TCP keep-alive on the PLC socket.
    ///
    /// Default: true
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.config.keep_alive = enabled;
        self
    }

    /// Set the number of parallel jobs requested from the PLC.
    ///
    /// The PLC may grant fewer. Default: 10
    pub fn max_jobs(mut self, jobs: u16) -> Self {
        self.config.max_jobs = jobs;
        self
    }

    /// Set the PDU size requested from the PLC.
    ///
    /// Default: 960
    pub fn pdu_size(mut self, size: u16) -> Self {
        self.config.pdu_size = size;
        self
    }

    /// Set the read buffer size of the receive task.
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.config.receive_buffer_size = size;
        self
    }

    /// Set the queue depth of each alarm subscription.
    ///
    /// Default: 16
    pub fn indication_queue_depth(mut self, depth: usize) -> Self {
        self.config.indication_queue_depth = depth;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer_channel_capacity = capacity;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Validate the configuration and create an unconnected client.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        Ok(Client::new(self.config))
    }

    /// Connect to `endpoint` (`host` or `host:port`) and open the client.
    pub async fn open(mut self, endpoint: &str) -> Result<Client> {
        let endpoint: Endpoint = endpoint.parse()?;
        self.config.host = endpoint.host;
        self.config.port = endpoint.port;
        let client = self.build()?;
        client.open().await?;
        Ok(client)
    }
}

/// State shared by the client handles and the background tasks.
///
/// Background tasks hold it weakly, so dropping the last [`Client`]
/// closes the connection.
struct Shared {
    config: ClientConfig,
    endpoint: Endpoint,
    lifecycle: Arc<Lifecycle>,
    gate: AdmissionGate,
    refs: ReferenceAllocator,
    pool: BufferPool,
    /// Set by `close()`; stops reconnecting and marks the next EOF as planned.
    closing: AtomicBool,
    /// Session generation for which alarm updates are enabled.
    alarm_updates: AsyncMutex<Option<u64>>,
}

/// A connection to one PLC.
///
/// Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn new(config: ClientConfig) -> Self {
        let endpoint = Endpoint::new(config.host.clone(), config.port);
        Self {
            shared: Arc::new(Shared {
                config,
                endpoint,
                lifecycle: Arc::new(Lifecycle::new()),
                gate: AdmissionGate::new(0),
                refs: ReferenceAllocator::new(),
                pool: BufferPool::new(),
                closing: AtomicBool::new(false),
                alarm_updates: AsyncMutex::new(None),
            }),
        }
    }

    /// Open the connection.
    ///
    /// Does nothing when already open, and waits for a running reconnect.
    /// Any failure leaves the client `Closed` and returns `NotConnected`;
    /// the cause is logged.
    pub async fn open(&self) -> Result<()> {
        let shared = &self.shared;
        match shared.lifecycle.state() {
            ConnectionState::Opened => return Ok(()),
            ConnectionState::Connecting => {
                return if self
                    .wait_for_state(ConnectionState::Opened, shared.config.connect_timeout())
                    .await
                {
                    Ok(())
                } else {
                    Err(S7Error::NotConnected)
                };
            }
            _ => {}
        }

        shared.closing.store(false, Ordering::Release);
        let Some(generation) = shared.lifecycle.begin_connect() else {
            return Err(S7Error::NotConnected);
        };
        match shared.establish(generation, false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(endpoint = %shared.endpoint, error = %e, "Failed to open connection");
                Err(S7Error::NotConnected)
            }
        }
    }

    /// Close the connection.
    ///
    /// Pending requests and subscriptions end with `NotConnected`. Safe to
    /// call when already closed.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Send a request and wait for its response.
    pub async fn request<R>(&self, request: &R, timeout: Duration) -> Result<R::Response>
    where
        R: Request,
    {
        self.shared.execute(request, timeout, None).await
    }

    /// Like [`request`](Self::request), but gives up with `Cancelled` once
    /// `cancel` fires.
    pub async fn request_cancellable<R>(
        &self,
        request: &R,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<R::Response>
    where
        R: Request,
    {
        self.shared.execute(request, timeout, Some(cancel)).await
    }

    /// Read the given items; fails with `ItemFailed` if any item failed.
    pub async fn read(&self, items: Vec<ItemAddress>) -> Result<Vec<Bytes>> {
        check_item_count(items.len())?;
        let request = ReadRequest::new(items);
        if let Some((pdu_size, _)) = self.shared.lifecycle.negotiated() {
            if request.response_size() > pdu_size as usize {
                return Err(S7Error::protocol(format!(
                    "Read response of {} bytes exceeds PDU size {}",
                    request.response_size(),
                    pdu_size
                )));
            }
        }

        let ack = self
            .request(&request, self.shared.config.request_timeout())
            .await?;
        if ack.items.len() != request.items.len() {
            return Err(S7Error::malformed(format!(
                "Read ack carries {} items, requested {}",
                ack.items.len(),
                request.items.len()
            )));
        }
        ack.items.into_iter().map(|item| item.into_result()).collect()
    }

    /// Write the given items; fails with `ItemFailed` if any item failed.
    pub async fn write(&self, items: Vec<WriteItem>) -> Result<()> {
        check_item_count(items.len())?;
        let count = items.len();
        let ack = self
            .request(&WriteRequest::new(items), self.shared.config.request_timeout())
            .await?;
        if ack.items.len() != count {
            return Err(S7Error::malformed(format!(
                "Write ack carries {} items, requested {}",
                ack.items.len(),
                count
            )));
        }
        ack.items.into_iter().try_for_each(|item| item.into_result())
    }

    /// Read the alarms currently pending on the PLC.
    ///
    /// The listing may span several data units; all of them are requested
    /// under the same PDU reference. Any failure fails the whole read.
    pub async fn read_pending_alarms(&self) -> Result<Vec<PlcAlarm>> {
        let shared = &self.shared;
        let timeout = shared.config.request_timeout();
        shared.lifecycle.session()?;

        let id = shared.refs.next();
        let _permit = shared.admit(id, deadline_after(timeout), None).await?;

        let mut ack = shared
            .alarm_round(&PendingAlarmsRequest::start(), id, timeout)
            .await?;
        if ack.payload().is_empty() && !ack.has_more() {
            return Ok(Vec::new());
        }

        let total = listing_total_length(ack.payload())?;
        let mut listing = FragmentAccumulator::start(&shared.pool, total);
        loop {
            if ack.has_more() && ack.payload().is_empty() {
                return Err(S7Error::malformed("Empty data unit in alarm listing"));
            }
            listing.push(ack.payload())?;
            if !ack.has_more() {
                break;
            }
            let follow_up = PendingAlarmsRequest::follow_up(ack.sequence_number());
            ack = shared.alarm_round(&follow_up, id, timeout).await?;
        }

        tracing::debug!(bytes = total, "Alarm listing received");
        listing.finish(decode_alarm_listing)
    }

    /// Enable alarm updates and subscribe to the indications.
    pub async fn subscribe_alarms(&self) -> Result<AlarmSubscription> {
        let shared = &self.shared;
        let (id, rx) = shared
            .lifecycle
            .subscribe(shared.config.indication_queue_depth)?;
        let subscription = AlarmSubscription::new(id, rx, shared.lifecycle.clone());
        shared.enable_alarm_updates().await?;
        Ok(subscription)
    }

    /// Ask the PLC to stop sending alarm indications.
    pub async fn disable_alarm_updates(&self) -> Result<()> {
        let shared = &self.shared;
        let mut enabled = shared.alarm_updates.lock().await;
        let ack = shared
            .execute(
                &AlarmUpdateRequest::new(false),
                shared.config.request_timeout(),
                None,
            )
            .await?;
        ack.check()?;
        *enabled = None;
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    /// Watch connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.lifecycle.subscribe_state()
    }

    /// Wait until the state is `target`; false if `timeout` elapsed first.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut states = self.shared.lifecycle.subscribe_state();
        let reached = matches!(
            tokio::time::timeout(timeout, states.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Negotiated PDU size of the open connection.
    pub fn pdu_size(&self) -> Option<u16> {
        self.shared.lifecycle.negotiated().map(|(pdu_size, _)| pdu_size)
    }

    /// Number of requests allowed in flight.
    pub fn capacity(&self) -> usize {
        self.shared.gate.capacity()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.lifecycle.pending()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

fn check_item_count(count: usize) -> Result<()> {
    if count == 0 || count > MAX_ITEMS {
        return Err(S7Error::protocol(format!(
            "Item count {} outside 1..={}",
            count, MAX_ITEMS
        )));
    }
    Ok(())
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `timeout` from now, saturating far in the future.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

impl Shared {
    async fn execute<R: Request>(
        &self,
        request: &R,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<R::Response> {
        let deadline = deadline_after(timeout);
        self.lifecycle.session()?;

        let id = self.refs.next();
        let _permit = self.admit(id, deadline, cancel).await?;
        let frame = self.round_trip(request, id, deadline, cancel).await?;
        decode(&frame)
    }

    /// Wait for a gate slot until `deadline`.
    async fn admit(
        &self,
        id: u16,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<AdmissionPermit> {
        let acquire = tokio::time::timeout_at(deadline, self.gate.acquire());
        let acquired = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(S7Error::Cancelled),
                acquired = acquire => acquired,
            },
            None => acquire.await,
        };
        acquired.map_err(|_| S7Error::ReadTimeout { reference: id })?
    }

    /// Send one request under reference `id` and wait for its response frame.
    async fn round_trip<R: Request>(
        &self,
        request: &R,
        id: u16,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<Frame> {
        let session = self.lifecycle.session()?;
        let telegram = encode(request, id)?;
        let pdu_length = telegram.len() - ISO_HEADER_SIZE;
        if pdu_length > session.pdu_size as usize {
            return Err(S7Error::protocol(format!(
                "Request PDU of {} bytes exceeds negotiated size {}",
                pdu_length, session.pdu_size
            )));
        }

        let (token, rx) = self.lifecycle.register(id, <R::Response as Datagram>::KIND)?;
        let pending = PendingRequest::new(id, token, rx, self.lifecycle.clone());
        session.writer.send(telegram).await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        match cancel {
            Some(cancel) => pending.wait_cancellable(remaining, cancel).await,
            None => pending.wait(remaining).await,
        }
    }

    /// Enable alarm updates once per session.
    async fn enable_alarm_updates(&self) -> Result<()> {
        let mut enabled = self.alarm_updates.lock().await;
        let generation = self.lifecycle.generation().ok_or(S7Error::NotConnected)?;
        if *enabled == Some(generation) {
            return Ok(());
        }
        let ack = self
            .execute(
                &AlarmUpdateRequest::new(true),
                self.config.request_timeout(),
                None,
            )
            .await?;
        ack.check()?;
        *enabled = Some(generation);
        tracing::debug!(generation, "Alarm updates enabled");
        Ok(())
    }

    async fn alarm_round(
        &self,
        request: &PendingAlarmsRequest,
        id: u16,
        timeout: Duration,
    ) -> Result<PendingAlarmsAck> {
        let frame = self
            .round_trip(request, id, deadline_after(timeout), None)
            .await?;
        let ack: PendingAlarmsAck = decode(&frame)?;
        ack.check()?;
        Ok(ack)
    }

    /// Run connection attempt `generation` and install the session.
    async fn establish(self: &Arc<Self>, generation: u64, reconnect: bool) -> Result<()> {
        match self.connect_session(generation).await {
            Ok((session, ready)) => match self.lifecycle.opened(session) {
                Ok(()) => {
                    let _ = ready.send(());
                    tracing::debug!(endpoint = %self.endpoint, generation, "Connection opened");
                    Ok(())
                }
                Err(session) => {
                    session.teardown();
                    Err(S7Error::NotConnected)
                }
            },
            Err(e) => {
                self.lifecycle.connect_failed(generation, reconnect);
                Err(e)
            }
        }
    }

    async fn connect_session(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<(Session, oneshot::Sender<()>)> {
        let config = &self.config;
        let options = TransportOptions {
            connect_timeout: config.connect_timeout(),
            nodelay: true,
            keep_alive: config.keep_alive,
        };
        let transport = TcpTransport::connect(&self.endpoint, &options).await?;
        let (read_half, mut write_half) = transport.into_split();
        let mut reader = FrameReader::with_buffer_size(read_half, config.receive_buffer_size);

        let negotiated = negotiate(
            &mut reader,
            &mut write_half,
            &ConnectionRequest::new(config.remote_tsap()),
            &CommunicationSetup::new(config.max_jobs, config.max_jobs, config.pdu_size),
            self.refs.next(),
            config.connect_timeout(),
        )
        .await?;
        self.gate.resize(negotiated.capacity as usize);

        let writer_config = WriterConfig {
            channel_capacity: config.writer_channel_capacity,
        };
        let (writer, writer_task) = spawn_writer_task(write_half, writer_config);
        let mut session = Session::new(generation, writer, negotiated.pdu_size, negotiated.capacity);
        session.attach(writer_task.abort_handle());

        let (ready_tx, ready_rx) = oneshot::channel();
        let receiver = tokio::spawn(receive_task(
            Arc::downgrade(self),
            self.lifecycle.clone(),
            generation,
            reader,
            writer_task,
            ready_rx,
        ));
        session.attach(receiver.abort_handle());
        Ok((session, ready_tx))
    }

    /// Called by the receive task once its session is over.
    fn session_ended(self: &Arc<Self>, generation: u64, outcome: Result<()>) {
        let closing = self.closing.load(Ordering::Acquire);
        if !closing {
            match &outcome {
                Ok(()) => tracing::warn!(generation, "PLC closed the connection"),
                Err(e) => tracing::error!(generation, error = %e, "Receive loop failed"),
            }
        }

        let reconnect = self.config.auto_reconnect && !closing;
        if self.lifecycle.connection_lost(generation, reconnect) && reconnect {
            self.spawn_reconnect(generation);
        }
    }

    /// Retry until a session follows `lost`, the client closes, or another
    /// attempt supersedes this loop.
    fn spawn_reconnect(self: &Arc<Self>, lost: u64) {
        let shared = Arc::downgrade(self);
        let interval = self.config.reconnect_interval();
        tokio::spawn(async move {
            let mut previous = lost;
            let mut attempt = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if shared.closing.load(Ordering::Acquire) {
                    return;
                }
                let Some(generation) = shared.lifecycle.begin_reconnect(previous) else {
                    tracing::debug!(previous, "Reconnect loop superseded");
                    return;
                };
                previous = generation;

                attempt += 1;
                match shared.establish(generation, true).await {
                    Ok(()) => {
                        tracing::debug!(attempt, "Reconnected");
                        return;
                    }
                    Err(e) => tracing::warn!(attempt, error = %e, "Reconnect failed"),
                }
            }
        });
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if let Some(session) = self.lifecycle.begin_close() {
            if let Some(session) = session {
                session.teardown();
            }
            self.lifecycle.finish_close();
            tracing::debug!(endpoint = %self.endpoint, "Connection closed");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receive task of one session.
///
/// Waits until the session is installed, then reads until EOF, a framing
/// error or the end of the writer task.
async fn receive_task(
    shared: Weak<Shared>,
    lifecycle: Arc<Lifecycle>,
    generation: u64,
    reader: FrameReader<OwnedReadHalf>,
    writer_task: JoinHandle<Result<()>>,
    ready: oneshot::Receiver<()>,
) {
    if ready.await.is_err() {
        return;
    }

    let outcome = tokio::select! {
        result = read_loop(reader, &lifecycle) => result,
        result = writer_task => match result {
            Ok(Ok(())) => Err(S7Error::SendFailure),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(S7Error::SendFailure),
        },
    };

    if let Some(shared) = shared.upgrade() {
        shared.session_ended(generation, outcome);
    }
}

/// Main read loop - reads frames and dispatches them.
async fn read_loop(mut reader: FrameReader<OwnedReadHalf>, lifecycle: &Lifecycle) -> Result<()> {
    while let Some(frame) = reader.next_frame().await? {
        dispatch_frame(frame, lifecycle)?;
    }
    Ok(())
}

/// Route one frame to its waiter or to the indication subscribers.
///
/// Only a disconnect request ends the session; everything else is
/// delivered or logged.
fn dispatch_frame(frame: Frame, lifecycle: &Lifecycle) -> Result<()> {
    if frame.is_disconnect() {
        return Err(S7Error::protocol("PLC sent a disconnect request"));
    }
    if !frame.is_data() {
        tracing::warn!(tpdu = frame.tpdu_code, "Ignoring unexpected COTP TPDU");
        return Ok(());
    }

    let header = match frame.s7_header() {
        Ok(header) => header,
        Err(e) => {
            match frame.pdu_ref() {
                Some(id) if id != 0 => {
                    lifecycle.fail(id, e);
                }
                _ => tracing::warn!(error = %e, "Dropping malformed PDU"),
            }
            return Ok(());
        }
    };

    let kind = MessageKind::classify(&header, frame.parameter(&header));
    if kind.is_indication() {
        let delivered = lifecycle.broadcast(&frame);
        tracing::debug!(delivered, "Alarm indication");
        return Ok(());
    }

    if header.has_error() {
        lifecycle.fail(
            header.pdu_ref,
            S7Error::Plc {
                class: header.error_class,
                code: header.error_code,
            },
        );
        return Ok(());
    }

    lifecycle.resolve(header.pdu_ref, kind, frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_write::ReadAck;
    use crate::codec::{encode_pdu, DataItem};
    use crate::protocol::{rosctr, S7Header};
    use crate::writer::WriterHandle;
    use bytes::BytesMut;
    use tokio::sync::mpsc;

    fn opened() -> (Lifecycle, mpsc::Receiver<Bytes>) {
        let lifecycle = Lifecycle::new();
        let generation = lifecycle.begin_connect().unwrap();
        let (tx, rx) = mpsc::channel(4);
        assert!(lifecycle
            .opened(Session::new(generation, WriterHandle::new(tx), 480, 2))
            .is_ok());
        (lifecycle, rx)
    }

    fn read_ack(pdu_ref: u16) -> Frame {
        let ack = ReadAck {
            items: vec![DataItem::octets(vec![1, 2])],
        };
        Frame::data(encode_pdu(&ack, pdu_ref))
    }

    #[test]
    fn test_builder_defaults() {
        let builder = ClientBuilder::new();
        assert_eq!(builder.config(), &ClientConfig::default());
    }

    #[test]
    fn test_builder_method_chaining() {
        let client = Client::builder()
            .host("10.1.1.1")
            .port(1102)
            .connection_type(ConnectionType::Op)
            .rack(0)
            .slot(1)
            .max_jobs(4)
            .pdu_size(480)
            .request_timeout(Duration::from_millis(250))
            .auto_reconnect(false)
            .build()
            .unwrap();

        assert_eq!(client.config().remote_tsap(), 0x0201);
        assert_eq!(client.config().request_timeout_ms, 250);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.pdu_size(), None);
    }

    #[test]
    fn test_builder_saturates_huge_durations() {
        let builder = Client::builder()
            .connect_timeout(Duration::MAX)
            .request_timeout(Duration::MAX)
            .reconnect_interval(Duration::MAX)
            .keep_alive(false);
        let config = builder.config();
        assert_eq!(config.connect_timeout_ms, u64::MAX);
        assert_eq!(config.request_timeout_ms, u64::MAX);
        assert_eq!(config.reconnect_interval_ms, u64::MAX);
        assert!(!config.keep_alive);

        assert!(deadline_after(config.request_timeout()) > Instant::now());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        assert!(matches!(
            Client::builder().max_jobs(0).build(),
            Err(S7Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_requests_fail_fast_when_closed() {
        let client = Client::builder().build().unwrap();
        let result = client
            .read(vec![ItemAddress::bytes(
                crate::codec::read_write::Area::DataBlock,
                1,
                0,
                2,
            )])
            .await;
        assert!(matches!(result, Err(S7Error::NotConnected)));
        assert!(matches!(
            client.read_pending_alarms().await,
            Err(S7Error::NotConnected)
        ));
        assert!(client.subscribe_alarms().await.is_err());
    }

    #[test]
    fn test_item_count_checked() {
        assert!(check_item_count(0).is_err());
        assert!(check_item_count(1).is_ok());
        assert!(check_item_count(MAX_ITEMS + 1).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_resolves_by_reference() {
        let (lifecycle, _rx) = opened();
        let (_, mut five) = lifecycle.register(5, MessageKind::ReadAck).unwrap();
        let (_, mut six) = lifecycle.register(6, MessageKind::ReadAck).unwrap();

        dispatch_frame(read_ack(6), &lifecycle).unwrap();
        dispatch_frame(read_ack(5), &lifecycle).unwrap();

        assert_eq!(five.try_recv().unwrap().unwrap().pdu_ref(), Some(5));
        assert_eq!(six.try_recv().unwrap().unwrap().pdu_ref(), Some(6));
    }

    #[tokio::test]
    async fn test_dispatch_error_ack() {
        let (lifecycle, _rx) = opened();
        let (_, mut rx) = lifecycle.register(9, MessageKind::ReadAck).unwrap();

        let mut pdu = BytesMut::new();
        S7Header::new(rosctr::ACK, 9, 0, 0)
            .with_error(0x81, 0x04)
            .encode_into(&mut pdu);
        dispatch_frame(Frame::data(pdu.freeze()), &lifecycle).unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(S7Error::Plc {
                class: 0x81,
                code: 0x04
            })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_malformed_goes_to_its_waiter() {
        let (lifecycle, _rx) = opened();
        let (_, mut rx) = lifecycle.register(3, MessageKind::ReadAck).unwrap();

        // Header claims 16 parameter bytes that are missing.
        let pdu = [0x32, 0x03, 0x00, 0x00, 0x00, 0x03, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00];
        dispatch_frame(Frame::data(Bytes::copy_from_slice(&pdu)), &lifecycle).unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(S7Error::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_disconnect_ends_session() {
        let (lifecycle, _rx) = opened();
        let frame = Frame::new(
            crate::protocol::tpdu::DISCONNECT_REQUEST,
            Bytes::from_static(&[0, 1, 0, 0x44, 0]),
            Bytes::new(),
        );
        assert!(dispatch_frame(frame, &lifecycle).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_reference_is_dropped() {
        let (lifecycle, _rx) = opened();
        assert!(dispatch_frame(read_ack(77), &lifecycle).is_ok());
        assert_eq!(lifecycle.pending(), 0);
    }
}
