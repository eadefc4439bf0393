//! In-process mock PLC for end-to-end tests.
//!
//! Accepts connections on `127.0.0.1:0`, answers the COTP connect and the
//! communication setup, then serves read/write jobs, pending-alarm queries
//! and alarm update requests. Tests steer it through [`MockPlc`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use s7wire_client::codec::alarms::{
    encode_alarm_listing, AlarmIndication, AlarmUpdateAck, AlarmUpdateRequest, PendingAlarmsAck,
    PendingAlarmsRequest, PlcAlarm,
};
use s7wire_client::codec::read_write::{
    ReadAck, ReadRequest, WriteAck, WriteItemResult, WriteRequest,
};
use s7wire_client::codec::setup::{CommunicationSetup, CommunicationSetupAck};
use s7wire_client::codec::{decode, encode, return_code, transport_size, DataItem, MessageKind};
use s7wire_client::control::{ConnectionConfirm, ConnectionRequest};
use s7wire_client::protocol::{Frame, FrameReader};

/// Sequence number the mock stamps on listing data units.
const LISTING_SEQUENCE: u8 = 0x21;

/// Behaviour of the mock PLC.
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub pdu_size: u16,
    pub capacity: u16,
    /// Delay before each read/write ack.
    pub delay: Duration,
    /// Delay before the communication setup ack.
    pub setup_delay: Duration,
    /// Hold the first read of each pair and answer it after the second.
    pub reverse_pairs: bool,
    /// Size of each pending-alarm data unit.
    pub fragment_size: usize,
    pub alarms: Vec<PlcAlarm>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            pdu_size: 480,
            capacity: 2,
            delay: Duration::ZERO,
            setup_delay: Duration::ZERO,
            reverse_pairs: false,
            fragment_size: 200,
            alarms: Vec::new(),
        }
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

struct State {
    options: MockOptions,
    /// Read/write jobs are swallowed without an answer.
    silent: AtomicBool,
    connections: AtomicUsize,
    jobs_received: AtomicUsize,
    alarm_update_requests: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    link: Mutex<Option<Link>>,
    held: Mutex<Option<Bytes>>,
}

/// Handle to a running mock PLC.
pub struct MockPlc {
    port: u16,
    state: Arc<State>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockPlc {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State {
            options,
            silent: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            jobs_received: AtomicUsize::new(0),
            alarm_update_requests: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
            link: Mutex::new(None),
            held: Mutex::new(None),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, accept_state.clone()));
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Connections that completed the setup.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn jobs_received(&self) -> usize {
        self.state.jobs_received.load(Ordering::SeqCst)
    }

    /// Alarm update enable/disable requests received.
    pub fn alarm_update_requests(&self) -> usize {
        self.state.alarm_update_requests.load(Ordering::SeqCst)
    }

    /// Highest number of jobs received but not yet answered.
    pub fn max_outstanding(&self) -> usize {
        self.state.max_outstanding.load(Ordering::SeqCst)
    }

    /// Push an alarm indication on the current connection.
    pub fn push_alarms(&self, alarms: Vec<PlcAlarm>) {
        let telegram = encode(&AlarmIndication::new(alarms).unwrap(), 0).unwrap();
        if let Some(link) = self.state.link.lock().unwrap().as_ref() {
            let _ = link.outbound.send(telegram);
        }
    }

    /// Close the current connection from the PLC side.
    pub fn drop_connection(&self) {
        if let Some(link) = self.state.link.lock().unwrap().take() {
            link.cancel.cancel();
        }
    }

    /// Stop accepting new connections.
    pub fn stop_accepting(&self) {
        self.accept_task.abort();
    }
}

impl Drop for MockPlc {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connection();
    }
}

async fn serve(socket: TcpStream, state: Arc<State>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = FrameReader::new(read_half);

    let Ok(Some(frame)) = reader.next_frame().await else {
        return;
    };
    let request = ConnectionRequest::decode(&frame).unwrap();
    let confirm = ConnectionConfirm::answer(&request).encode();
    if write_half.write_all(&confirm).await.is_err() {
        return;
    }

    let Ok(Some(frame)) = reader.next_frame().await else {
        return;
    };
    let setup: CommunicationSetup = decode(&frame).unwrap();
    let capacity = state.options.capacity.min(setup.max_amq_calling);
    let ack = CommunicationSetupAck::new(capacity, capacity, state.options.pdu_size);
    let pdu_ref = frame.pdu_ref().unwrap();
    tokio::time::sleep(state.options.setup_delay).await;
    if write_half
        .write_all(&encode(&ack, pdu_ref).unwrap())
        .await
        .is_err()
    {
        return;
    }

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let cancel = CancellationToken::new();
    *state.link.lock().unwrap() = Some(Link {
        outbound: outbound.clone(),
        cancel: cancel.clone(),
    });
    state.connections.fetch_add(1, Ordering::SeqCst);

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                telegram = outbound_rx.recv() => match telegram {
                    Some(telegram) => {
                        if write_half.write_all(&telegram).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let mut listing_cursor = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next_frame() => match frame {
                Ok(Some(frame)) => handle(&frame, &state, &outbound, &mut listing_cursor),
                _ => break,
            },
        }
    }

    cancel.cancel();
    let _ = writer.await;
}

fn handle(frame: &Frame, state: &Arc<State>, outbound: &mpsc::UnboundedSender<Bytes>, cursor: &mut usize) {
    let header = frame.s7_header().unwrap();
    let id = header.pdu_ref;

    match MessageKind::classify(&header, frame.parameter(&header)) {
        MessageKind::ReadRequest => {
            let request: ReadRequest = decode(frame).unwrap();
            let items = request
                .items
                .iter()
                .map(|address| {
                    DataItem::new(
                        return_code::SUCCESS,
                        transport_size::BYTE_WORD_DWORD,
                        vec![address.db_number as u8; address.byte_length()],
                    )
                })
                .collect();
            job(state, outbound, encode(&ReadAck { items }, id).unwrap());
        }
        MessageKind::WriteRequest => {
            let request: WriteRequest = decode(frame).unwrap();
            let items = vec![
                WriteItemResult {
                    return_code: return_code::SUCCESS
                };
                request.items.len()
            ];
            job(state, outbound, encode(&WriteAck { items }, id).unwrap());
        }
        MessageKind::PendingAlarmsRequest => {
            let request: PendingAlarmsRequest = decode(frame).unwrap();
            if !request.is_follow_up() {
                *cursor = 0;
            } else {
                assert_eq!(request.sequence_number(), LISTING_SEQUENCE);
            }
            let listing = encode_alarm_listing(&state.options.alarms).unwrap();
            let end = (*cursor + state.options.fragment_size).min(listing.len());
            let ack = PendingAlarmsAck::fragment(
                LISTING_SEQUENCE,
                end < listing.len(),
                listing.slice(*cursor..end),
            );
            *cursor = end;
            let _ = outbound.send(encode(&ack, id).unwrap());
        }
        MessageKind::AlarmUpdateRequest => {
            let _request: AlarmUpdateRequest = decode(frame).unwrap();
            state.alarm_update_requests.fetch_add(1, Ordering::SeqCst);
            let _ = outbound.send(encode(&AlarmUpdateAck::accepted(0x00), id).unwrap());
        }
        _ => {}
    }
}

/// Answer a read/write job, honouring silence, delay and reordering.
fn job(state: &Arc<State>, outbound: &mpsc::UnboundedSender<Bytes>, reply: Bytes) {
    state.jobs_received.fetch_add(1, Ordering::SeqCst);
    if state.silent.load(Ordering::SeqCst) {
        return;
    }

    if state.options.reverse_pairs {
        let mut held = state.held.lock().unwrap();
        match held.take() {
            None => *held = Some(reply),
            Some(first) => {
                let _ = outbound.send(reply);
                let _ = outbound.send(first);
            }
        }
        return;
    }

    let outstanding = state.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);

    let state = state.clone();
    let outbound = outbound.clone();
    tokio::spawn(async move {
        tokio::time::sleep(state.options.delay).await;
        state.outstanding.fetch_sub(1, Ordering::SeqCst);
        let _ = outbound.send(reply);
    });
}

/// Alarm with a recognisable id.
pub fn alarm(id: u16) -> PlcAlarm {
    PlcAlarm {
        alarm_type: 0x01,
        msg_number: 0x0020_0000 + u32::from(id),
        id,
        event_state: 0x01,
        ack_state_coming: 0x00,
        ack_state_going: 0x00,
        associated_values: vec![0x10, id as u8],
    }
}
