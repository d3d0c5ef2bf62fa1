//! In-process mock NATS server for integration tests.
//!
//! Speaks the server side of the text protocol over real TCP: INFO on
//! accept, CONNECT/PING/SUB/UNSUB/PUB/HPUB from clients, MSG/HMSG
//! delivery with queue-group fan-out, no-responder 503s, and (when
//! enabled) a small JetStream API: stream create/info/purge, consumer
//! create/info, pull MSG.NEXT, and ack handling.

// not every test binary exercises every helper
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct MockSub {
    conn_id: u64,
    sid: String,
    subject: String,
    queue: Option<String>,
    delivered: u64,
    /// UNSUB <sid> <max>: total deliveries before the server drops the
    /// subscription.
    max: Option<u64>,
}

#[derive(Debug)]
struct MockStream {
    subjects: Vec<String>,
    config: Value,
    /// Sequence n lives at index n-1; deleted messages leave a
    /// tombstone so later sequences keep their numbers.
    messages: Vec<Option<(String, Vec<u8>)>>,
    consumers: HashMap<String, MockConsumer>,
}

impl MockStream {
    fn live_count(&self) -> usize {
        self.messages.iter().flatten().count()
    }
}

#[derive(Debug, Default)]
struct MockConsumer {
    acked: HashSet<u64>,
}

#[derive(Default)]
struct JsState {
    streams: HashMap<String, MockStream>,
}

struct State {
    subs: Mutex<Vec<MockSub>>,
    writers: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    queue_rr: Mutex<HashMap<String, usize>>,
    jetstream: Option<Mutex<JsState>>,
    next_conn: AtomicU64,
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        Self::start_inner(false).await
    }

    pub async fn start_with_jetstream() -> MockServer {
        Self::start_inner(true).await
    }

    async fn start_inner(jetstream: bool) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            subs: Mutex::new(Vec::new()),
            writers: Mutex::new(HashMap::new()),
            queue_rr: Mutex::new(HashMap::new()),
            jetstream: jetstream.then(|| Mutex::new(JsState::default())),
            next_conn: AtomicU64::new(1),
        });

        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_state = state.clone();
        let accept_conn_tasks = conn_tasks.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = accept_state.clone();
                let handle = tokio::spawn(async move {
                    serve_connection(socket, conn_state).await;
                });
                accept_conn_tasks.lock().push(handle);
            }
        });

        MockServer {
            addr,
            state,
            accept_task,
            conn_tasks,
        }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    /// Kill every live client connection (for reconnect tests); the
    /// listener keeps accepting.
    pub fn drop_connections(&self) {
        for handle in self.conn_tasks.lock().drain(..) {
            handle.abort();
        }
        self.state.writers.lock().clear();
        self.state.subs.lock().clear();
    }

    /// Message count stored in a mock stream.
    pub fn stream_len(&self, name: &str) -> usize {
        let js = self.state.jetstream.as_ref().unwrap().lock();
        js.streams.get(name).map(MockStream::live_count).unwrap_or(0)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for handle in self.conn_tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.').peekable();
    loop {
        match (pat.next(), sub.peek()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some(">"), Some(_)) => return true,
            (Some(_), None) => return false,
            (Some("*"), Some(_)) => {
                sub.next();
            }
            (Some(p), Some(&s)) => {
                if p != s {
                    return false;
                }
                sub.next();
            }
        }
    }
}

async fn serve_connection(mut socket: TcpStream, state: Arc<State>) {
    let conn_id = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.writers.lock().insert(conn_id, tx);

    let info = json!({
        "server_id": "MOCK",
        "server_name": "mock-server",
        "version": "2.10.0",
        "proto": 1,
        "max_payload": 1_048_576,
        "headers": true,
        "jetstream": state.jetstream.is_some(),
    });
    let info_frame = format!("INFO {info}\r\n");

    let (mut read_half, mut write_half) = socket.split();
    if write_half.write_all(info_frame.as_bytes()).await.is_err() {
        return;
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(frame) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = read_half.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(consumed) = handle_frame(&buf, conn_id, &state) {
                        buf.drain(..consumed);
                    }
                }
            },
        }
    }

    state.writers.lock().remove(&conn_id);
    state.subs.lock().retain(|s| s.conn_id != conn_id);
}

/// Parse and act on one client frame; returns bytes consumed, or None
/// when the buffer holds no complete frame yet.
fn handle_frame(buf: &[u8], conn_id: u64, state: &Arc<State>) -> Option<usize> {
    let line_end = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&buf[..line_end]).unwrap().to_owned();
    let mut parts = line.split_ascii_whitespace();
    let command = parts.next().unwrap_or("").to_ascii_uppercase();
    let args: Vec<&str> = parts.collect();

    match command.as_str() {
        "CONNECT" | "PONG" => Some(line_end + 2),
        "PING" => {
            send(state, conn_id, b"PONG\r\n".to_vec());
            Some(line_end + 2)
        }
        "SUB" => {
            let (subject, queue, sid) = match args.len() {
                2 => (args[0], None, args[1]),
                3 => (args[0], Some(args[1].to_owned()), args[2]),
                _ => return Some(line_end + 2),
            };
            state.subs.lock().push(MockSub {
                conn_id,
                sid: sid.to_owned(),
                subject: subject.to_owned(),
                queue,
                delivered: 0,
                max: None,
            });
            Some(line_end + 2)
        }
        "UNSUB" => {
            if let Some(&sid) = args.first() {
                let max: Option<u64> = args.get(1).and_then(|m| m.parse().ok());
                let mut subs = state.subs.lock();
                match max {
                    None => subs.retain(|s| !(s.conn_id == conn_id && s.sid == sid)),
                    Some(max) => {
                        subs.retain(|s| {
                            !(s.conn_id == conn_id && s.sid == sid && s.delivered >= max)
                        });
                        for sub in subs
                            .iter_mut()
                            .filter(|s| s.conn_id == conn_id && s.sid == sid)
                        {
                            sub.max = Some(max);
                        }
                    }
                }
            }
            Some(line_end + 2)
        }
        "PUB" | "HPUB" => {
            let headers = command == "HPUB";
            let min_args = if headers { 2 } else { 1 };
            if args.len() < min_args + 1 {
                return Some(line_end + 2);
            }
            let subject = args[0].to_owned();
            let sizes = if headers { 2 } else { 1 };
            let reply = if args.len() > sizes + 1 {
                Some(args[1].to_owned())
            } else {
                None
            };
            let total: usize = args.last().unwrap().parse().unwrap();
            let header_len: usize = if headers {
                args[args.len() - 2].parse().unwrap()
            } else {
                0
            };
            let body_start = line_end + 2;
            if buf.len() < body_start + total + 2 {
                return None;
            }
            // headers are accepted but not inspected by the mock
            let payload = buf[body_start + header_len..body_start + total].to_vec();
            route_publish(state, conn_id, subject, reply, payload);
            Some(body_start + total + 2)
        }
        _ => Some(line_end + 2),
    }
}

fn send(state: &Arc<State>, conn_id: u64, frame: Vec<u8>) {
    if let Some(tx) = state.writers.lock().get(&conn_id) {
        let _ = tx.send(frame);
    }
}

fn msg_frame(subject: &str, sid: &str, reply: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut frame = match reply {
        Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()).into_bytes(),
        None => format!("MSG {subject} {sid} {}\r\n", payload.len()).into_bytes(),
    };
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}

fn status_frame(subject: &str, sid: &str, status: u16, description: &str) -> Vec<u8> {
    let block = if description.is_empty() {
        format!("NATS/1.0 {status}\r\n\r\n")
    } else {
        format!("NATS/1.0 {status} {description}\r\n\r\n")
    };
    let mut frame =
        format!("HMSG {subject} {sid} {} {}\r\n", block.len(), block.len()).into_bytes();
    frame.extend_from_slice(block.as_bytes());
    frame.extend_from_slice(b"\r\n");
    frame
}

fn route_publish(
    state: &Arc<State>,
    publisher: u64,
    subject: String,
    reply: Option<String>,
    payload: Vec<u8>,
) {
    // jetstream surfaces first
    if state.jetstream.is_some() {
        if subject.starts_with("$JS.API.") {
            handle_js_api(state, publisher, &subject, reply.as_deref(), &payload);
            return;
        }
        if subject.starts_with("$JS.ACK.") {
            handle_js_ack(state, &subject);
            return;
        }
        if let Some(reply) = reply.as_deref() {
            if js_capture(state, publisher, &subject, reply, &payload) {
                return;
            }
        }
    }

    // normal fan-out: every plain sub, one member per queue group
    let subs = state.subs.lock().clone();
    let matching: Vec<&MockSub> = subs
        .iter()
        .filter(|s| subject_matches(&s.subject, &subject))
        .collect();

    if matching.is_empty() {
        if let Some(reply) = reply {
            // no-responders: status 503 back to the requester's inbox
            let inbox_subs = subs
                .iter()
                .filter(|s| subject_matches(&s.subject, &reply))
                .collect::<Vec<_>>();
            for sub in inbox_subs {
                send(
                    state,
                    sub.conn_id,
                    status_frame(&reply, &sub.sid, 503, "No Responders"),
                );
            }
        }
        return;
    }

    let mut plain = Vec::new();
    let mut groups: HashMap<String, Vec<&MockSub>> = HashMap::new();
    for sub in matching {
        match &sub.queue {
            None => plain.push(sub),
            Some(queue) => groups.entry(queue.clone()).or_default().push(sub),
        }
    }
    let mut recipients: Vec<(u64, String)> = Vec::new();
    for sub in plain {
        send(
            state,
            sub.conn_id,
            msg_frame(&subject, &sub.sid, reply.as_deref(), &payload),
        );
        recipients.push((sub.conn_id, sub.sid.clone()));
    }
    for (queue, members) in groups {
        let mut rr = state.queue_rr.lock();
        let counter = rr.entry(queue).or_insert(0);
        let chosen = members[*counter % members.len()];
        *counter += 1;
        send(
            state,
            chosen.conn_id,
            msg_frame(&subject, &chosen.sid, reply.as_deref(), &payload),
        );
        recipients.push((chosen.conn_id, chosen.sid.clone()));
    }

    // auto-unsubscribe accounting
    let mut subs = state.subs.lock();
    for (conn_id, sid) in recipients {
        for sub in subs
            .iter_mut()
            .filter(|s| s.conn_id == conn_id && s.sid == sid)
        {
            sub.delivered += 1;
        }
    }
    subs.retain(|s| s.max.map_or(true, |max| s.delivered < max));
}

/// PUB with a reply on a stream-captured subject → store + PubAck.
fn js_capture(
    state: &Arc<State>,
    publisher: u64,
    subject: &str,
    reply: &str,
    payload: &[u8],
) -> bool {
    let mut js = state.jetstream.as_ref().unwrap().lock();
    for (name, stream) in js.streams.iter_mut() {
        if stream
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
        {
            stream
                .messages
                .push(Some((subject.to_owned(), payload.to_vec())));
            let ack = json!({"stream": name, "seq": stream.messages.len()});
            reply_json(state, publisher, reply, &ack);
            return true;
        }
    }
    false
}

fn handle_js_ack(state: &Arc<State>, subject: &str) {
    // $JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>
    let tokens: Vec<&str> = subject.split('.').collect();
    if tokens.len() < 9 {
        return;
    }
    let mut js = state.jetstream.as_ref().unwrap().lock();
    if let Some(stream) = js.streams.get_mut(tokens[2]) {
        if let Some(consumer) = stream.consumers.get_mut(tokens[3]) {
            if let Ok(seq) = tokens[5].parse::<u64>() {
                consumer.acked.insert(seq);
            }
        }
    }
}

fn reply_json(state: &Arc<State>, requester: u64, reply: &str, body: &Value) {
    // deliver through the requester's matching subscription
    let subs = state.subs.lock().clone();
    let payload = serde_json::to_vec(body).unwrap();
    for sub in subs
        .iter()
        .filter(|s| s.conn_id == requester && subject_matches(&s.subject, reply))
    {
        send(state, requester, msg_frame(reply, &sub.sid, None, &payload));
    }
}

fn stream_info_json(name: &str, stream: &MockStream) -> Value {
    json!({
        "config": stream.config,
        "created": "2024-01-01T00:00:00Z",
        "state": {
            "messages": stream.live_count(),
            "bytes": stream.messages.iter().flatten().map(|(_, p)| p.len() as u64).sum::<u64>(),
            "first_seq": stream
                .messages
                .iter()
                .position(Option::is_some)
                .map(|i| i + 1)
                .unwrap_or(0),
            "last_seq": stream.messages.len(),
            "consumer_count": stream.consumers.len(),
        },
        "did_create": true,
        "stream_name": name,
    })
}

fn consumer_info_json(stream_name: &str, consumer_name: &str, config: &Value) -> Value {
    json!({
        "stream_name": stream_name,
        "name": consumer_name,
        "created": "2024-01-01T00:00:00Z",
        "config": config,
        "delivered": {"consumer_seq": 0, "stream_seq": 0},
        "ack_floor": {"consumer_seq": 0, "stream_seq": 0},
        "num_ack_pending": 0,
        "num_redelivered": 0,
        "num_waiting": 0,
        "num_pending": 0,
    })
}

fn handle_js_api(
    state: &Arc<State>,
    requester: u64,
    subject: &str,
    reply: Option<&str>,
    payload: &[u8],
) {
    let Some(reply) = reply else { return };
    let suffix = subject.strip_prefix("$JS.API.").unwrap();
    let tokens: Vec<&str> = suffix.split('.').collect();

    let body: Value = match tokens.as_slice() {
        ["INFO"] => json!({
            "memory": 0, "storage": 0, "streams": 0, "consumers": 0,
            "limits": {"max_memory": -1, "max_storage": -1,
                       "max_streams": -1, "max_consumers": -1},
        }),
        ["STREAM", "CREATE", name] => {
            let config: Value = serde_json::from_slice(payload).unwrap();
            let subjects: Vec<String> = config["subjects"]
                .as_array()
                .map(|subjects| {
                    subjects
                        .iter()
                        .filter_map(|s| s.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            let mut js = state.jetstream.as_ref().unwrap().lock();
            let stream = js.streams.entry((*name).to_owned()).or_insert(MockStream {
                subjects,
                config,
                messages: Vec::new(),
                consumers: HashMap::new(),
            });
            stream_info_json(name, stream)
        }
        ["STREAM", "INFO", name] => {
            let js = state.jetstream.as_ref().unwrap().lock();
            match js.streams.get(*name) {
                Some(stream) => stream_info_json(name, stream),
                None => not_found_stream(),
            }
        }
        ["STREAM", "PURGE", name] => {
            let mut js = state.jetstream.as_ref().unwrap().lock();
            match js.streams.get_mut(*name) {
                Some(stream) => {
                    let purged = stream.live_count();
                    stream.messages.clear();
                    json!({"success": true, "purged": purged})
                }
                None => not_found_stream(),
            }
        }
        ["STREAM", "MSG", "GET", name] => {
            use base64::Engine;
            let request: Value = serde_json::from_slice(payload).unwrap();
            let js = state.jetstream.as_ref().unwrap().lock();
            match js.streams.get(*name) {
                Some(stream) => {
                    let found = if let Some(seq) = request["seq"].as_u64() {
                        seq.checked_sub(1)
                            .and_then(|i| stream.messages.get(i as usize))
                            .and_then(Option::as_ref)
                            .map(|m| (seq, m))
                    } else if let Some(subject) = request["last_by_subj"].as_str() {
                        stream
                            .messages
                            .iter()
                            .enumerate()
                            .rev()
                            .find_map(|(i, m)| match m {
                                Some(m) if m.0 == subject => Some((i as u64 + 1, m)),
                                _ => None,
                            })
                    } else {
                        None
                    };
                    match found {
                        Some((seq, (msg_subject, msg_payload))) => json!({
                            "message": {
                                "subject": msg_subject,
                                "seq": seq,
                                "data": base64::engine::general_purpose::STANDARD
                                    .encode(msg_payload),
                                "time": "2024-01-01T00:00:00Z",
                            }
                        }),
                        None => json!({"error": {"code": 404, "err_code": 10037,
                                        "description": "no message found"}}),
                    }
                }
                None => not_found_stream(),
            }
        }
        ["STREAM", "MSG", "DELETE", name] => {
            let request: Value = serde_json::from_slice(payload).unwrap();
            let seq = request["seq"].as_u64().unwrap_or(0) as usize;
            let mut js = state.jetstream.as_ref().unwrap().lock();
            match js.streams.get_mut(*name) {
                Some(stream) => {
                    match seq
                        .checked_sub(1)
                        .and_then(|i| stream.messages.get_mut(i))
                        .and_then(Option::take)
                    {
                        Some(_) => json!({"success": true}),
                        None => json!({"error": {"code": 404, "err_code": 10037,
                                        "description": "no message found"}}),
                    }
                }
                None => not_found_stream(),
            }
        }
        ["STREAM", "DELETE", name] => {
            let mut js = state.jetstream.as_ref().unwrap().lock();
            match js.streams.remove(*name) {
                Some(_) => json!({"success": true}),
                None => not_found_stream(),
            }
        }
        ["CONSUMER", "CREATE", stream_name, consumer_name] => {
            let request: Value = serde_json::from_slice(payload).unwrap();
            let mut js = state.jetstream.as_ref().unwrap().lock();
            match js.streams.get_mut(*stream_name) {
                Some(stream) => {
                    stream
                        .consumers
                        .entry((*consumer_name).to_owned())
                        .or_default();
                    consumer_info_json(stream_name, consumer_name, &request["config"])
                }
                None => not_found_stream(),
            }
        }
        ["CONSUMER", "INFO", stream_name, consumer_name] => {
            let js = state.jetstream.as_ref().unwrap().lock();
            match js
                .streams
                .get(*stream_name)
                .filter(|s| s.consumers.contains_key(*consumer_name))
            {
                Some(_) => consumer_info_json(stream_name, consumer_name, &json!({})),
                None => json!({"error": {"code": 404, "err_code": 10014,
                                "description": "consumer not found"}}),
            }
        }
        ["CONSUMER", "MSG", "NEXT", stream_name, consumer_name] => {
            // deliver unacked messages straight to the pull inbox
            let request: Value = serde_json::from_slice(payload).unwrap();
            let batch = request["batch"].as_u64().unwrap_or(1) as usize;
            let js = state.jetstream.as_ref().unwrap().lock();
            let Some(stream) = js.streams.get(*stream_name) else {
                return;
            };
            let Some(consumer) = stream.consumers.get(*consumer_name) else {
                return;
            };
            let pending: Vec<(u64, &(String, Vec<u8>))> = stream
                .messages
                .iter()
                .enumerate()
                .filter_map(|(i, m)| m.as_ref().map(|m| (i as u64 + 1, m)))
                .filter(|(seq, _)| !consumer.acked.contains(seq))
                .take(batch)
                .collect();
            let total_pending = pending.len();
            let subs = state.subs.lock().clone();
            let inbox_subs: Vec<&MockSub> = subs
                .iter()
                .filter(|s| s.conn_id == requester && subject_matches(&s.subject, reply))
                .collect();
            for (index, (seq, (msg_subject, msg_payload))) in pending.iter().enumerate() {
                let ack_subject = format!(
                    "$JS.ACK.{stream_name}.{consumer_name}.1.{seq}.{seq}.1700000000000000000.{}",
                    total_pending - index - 1
                );
                for sub in &inbox_subs {
                    send(
                        state,
                        requester,
                        msg_frame(msg_subject, &sub.sid, Some(&ack_subject), msg_payload),
                    );
                }
            }
            if total_pending < batch {
                // the request expires with nothing further to deliver
                for sub in &inbox_subs {
                    send(
                        state,
                        requester,
                        status_frame(reply, &sub.sid, 408, "Request Timeout"),
                    );
                }
            }
            return;
        }
        _ => json!({"error": {"code": 400, "err_code": 0,
                    "description": format!("unhandled api subject: {suffix}")}}),
    };
    reply_json(state, requester, reply, &body);
}

fn not_found_stream() -> Value {
    json!({"error": {"code": 404, "err_code": 10059, "description": "stream not found"}})
}
