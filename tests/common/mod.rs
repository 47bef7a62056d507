//! In-process scripted PostgreSQL server for integration tests.
//!
//! Speaks enough of protocol 3.0 for the driver: startup (trust or
//! cleartext password), simple query, Parse/Bind/Describe/Execute/Sync,
//! CancelRequest, LISTEN/NOTIFY and a handful of statements with scripted
//! results. Every executed statement is recorded.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use zero_pgdriver::Opts;

const CANCEL_REQUEST_CODE: i32 = 80877102;

#[derive(Debug, Clone, Default)]
pub struct FakeConfig {
    /// Require this cleartext password
    pub password: Option<String>,
    /// Statements starting with one of these fail with SQLSTATE XX000
    pub fail_on: Vec<String>,
    /// Reject PREPARE TRANSACTION like a server with max_prepared_transactions = 0
    pub disable_prepared: bool,
    /// Value announced for client_encoding
    pub client_encoding: Option<String>,
}

type Notification = (u32, String, String);

#[derive(Default)]
struct Shared {
    config: FakeConfig,
    log: Mutex<Vec<String>>,
    prepared: Mutex<Vec<String>>,
    cancels: Mutex<HashMap<u32, Arc<Notify>>>,
    listeners: Mutex<HashMap<String, Vec<(u32, mpsc::UnboundedSender<Notification>)>>>,
    next_pid: AtomicU32,
}

pub struct FakeServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl FakeServer {
    pub async fn start() -> Self {
        Self::with_config(FakeConfig::default()).await
    }

    pub async fn with_config(config: FakeConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            config,
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let _ = serve(shared, socket).await;
                });
            }
        });

        Self { addr, shared }
    }

    pub fn url(&self) -> String {
        format!("postgres://tester@127.0.0.1:{}/testdb", self.addr.port())
    }

    pub fn opts(&self) -> Opts {
        Opts {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            user: "tester".into(),
            database: Some("testdb".into()),
            ..Opts::default()
        }
    }

    /// Every statement executed so far, across all sessions.
    pub fn statements(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.shared.log.lock().unwrap().clear();
    }

    pub fn prepared(&self) -> Vec<String> {
        self.shared.prepared.lock().unwrap().clone()
    }

    pub fn add_prepared(&self, gid: &str) {
        self.shared.prepared.lock().unwrap().push(gid.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    InTransaction,
    InError,
}

impl Status {
    fn byte(self) -> u8 {
        match self {
            Status::Idle => b'I',
            Status::InTransaction => b'T',
            Status::InError => b'E',
        }
    }
}

enum Reply {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
        tag: String,
    },
    Command(String),
    Empty,
    Error {
        code: &'static str,
        message: String,
    },
    /// FATAL error, after which the session ends
    Terminate,
}

fn message(out: &mut Vec<u8>, type_byte: u8, body: &[u8]) {
    out.push(type_byte);
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
}

fn cstr(body: &mut Vec<u8>, s: &str) {
    body.extend_from_slice(s.as_bytes());
    body.push(0);
}

fn read_cstr(data: &[u8], pos: &mut usize) -> String {
    let end = data[*pos..].iter().position(|&b| b == 0).unwrap() + *pos;
    let s = String::from_utf8_lossy(&data[*pos..end]).into_owned();
    *pos = end + 1;
    s
}

fn read_i16(data: &[u8], pos: &mut usize) -> i16 {
    let v = i16::from_be_bytes([data[*pos], data[*pos + 1]]);
    *pos += 2;
    v
}

fn read_i32(data: &[u8], pos: &mut usize) -> i32 {
    let v = i32::from_be_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    v
}

fn error_body(severity: &str, code: &str, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'S');
    cstr(&mut body, severity);
    body.push(b'V');
    cstr(&mut body, severity);
    body.push(b'C');
    cstr(&mut body, code);
    body.push(b'M');
    cstr(&mut body, text);
    body.push(0);
    body
}

fn quoted(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(s)
        .replace("''", "'")
}

async fn serve(shared: Arc<Shared>, socket: TcpStream) -> std::io::Result<()> {
    let (mut rd, mut wr) = socket.into_split();

    let len = rd.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    rd.read_exact(&mut body).await?;
    let code = i32::from_be_bytes(body[0..4].try_into().unwrap());

    if code == CANCEL_REQUEST_CODE {
        let pid = u32::from_be_bytes(body[4..8].try_into().unwrap());
        let secret = u32::from_be_bytes(body[8..12].try_into().unwrap());
        let target = shared.cancels.lock().unwrap().get(&pid).cloned();
        if let Some(cancel) = target
            && secret == pid.wrapping_mul(7)
        {
            cancel.notify_one();
        }
        return Ok(());
    }

    let mut out = Vec::new();
    if let Some(password) = &shared.config.password {
        message(&mut out, b'R', &3i32.to_be_bytes());
        wr.write_all(&out).await?;
        out.clear();

        let type_byte = rd.read_u8().await?;
        let len = rd.read_i32().await?;
        let mut payload = vec![0u8; len as usize - 4];
        rd.read_exact(&mut payload).await?;
        let mut pos = 0;
        if type_byte != b'p' || read_cstr(&payload, &mut pos) != *password {
            message(
                &mut out,
                b'E',
                &error_body("FATAL", "28P01", "password authentication failed"),
            );
            wr.write_all(&out).await?;
            return Ok(());
        }
    }

    let pid = shared.next_pid.fetch_add(1, Ordering::SeqCst);
    let cancel = Arc::new(Notify::new());
    shared.cancels.lock().unwrap().insert(pid, cancel.clone());

    message(&mut out, b'R', &0i32.to_be_bytes());
    let mut key = pid.to_be_bytes().to_vec();
    key.extend_from_slice(&pid.wrapping_mul(7).to_be_bytes());
    message(&mut out, b'K', &key);
    let encoding = shared
        .config
        .client_encoding
        .clone()
        .unwrap_or_else(|| "UTF8".into());
    for (name, value) in [("client_encoding", encoding.as_str()), ("server_version", "16.0")] {
        let mut body = Vec::new();
        cstr(&mut body, name);
        cstr(&mut body, value);
        message(&mut out, b'S', &body);
    }
    message(&mut out, b'Z', b"I");
    wr.write_all(&out).await?;

    let (client_tx, mut client_rx) = mpsc::channel::<(u8, Vec<u8>)>(64);
    tokio::spawn(async move {
        loop {
            let Ok(type_byte) = rd.read_u8().await else { break };
            let Ok(len) = rd.read_i32().await else { break };
            let mut payload = vec![0u8; len as usize - 4];
            if rd.read_exact(&mut payload).await.is_err() {
                break;
            }
            if client_tx.send((type_byte, payload)).await.is_err() {
                break;
            }
        }
    });

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notification>();
    let mut session = Session {
        shared: shared.clone(),
        pid,
        cancel,
        notify_tx,
        status: Status::Idle,
        aborted: false,
        query: String::new(),
        params: Vec::new(),
        split: None,
        split_tail: Vec::new(),
    };

    loop {
        tokio::select! {
            msg = client_rx.recv() => {
                let Some((type_byte, payload)) = msg else { break };
                // The rest of a split notification goes out ahead of the reply
                let mut out = std::mem::take(&mut session.split_tail);
                let keep_going = session.handle(type_byte, &payload, &mut out).await;
                wr.write_all(&out).await?;
                if let Some(frame) = session.split.take() {
                    let (head, tail) = frame.split_at(7);
                    wr.write_all(head).await?;
                    session.split_tail = tail.to_vec();
                }
                if !keep_going {
                    break;
                }
            }
            Some((from, channel, payload)) = notify_rx.recv() => {
                write_notification(&mut wr, from, &channel, &payload).await?;
            }
        }
    }

    shared.cancels.lock().unwrap().remove(&pid);
    for senders in shared.listeners.lock().unwrap().values_mut() {
        senders.retain(|(p, _)| *p != pid);
    }
    Ok(())
}

fn notification_frame(pid: u32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    cstr(&mut body, channel);
    cstr(&mut body, payload);
    let mut out = Vec::new();
    message(&mut out, b'A', &body);
    out
}

async fn write_notification(
    wr: &mut OwnedWriteHalf,
    pid: u32,
    channel: &str,
    payload: &str,
) -> std::io::Result<()> {
    wr.write_all(&notification_frame(pid, channel, payload)).await
}

struct Session {
    shared: Arc<Shared>,
    pid: u32,
    cancel: Arc<Notify>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    status: Status,
    /// Skipping extended messages until Sync
    aborted: bool,
    query: String,
    params: Vec<Option<String>>,
    /// Notification for this session sent in two writes: the first 7 bytes
    /// after the current reply, the rest ahead of the next one
    split: Option<Vec<u8>>,
    split_tail: Vec<u8>,
}

impl Session {
    /// Handle one client message; false ends the session.
    async fn handle(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> bool {
        let mut pos = 0;
        match type_byte {
            b'Q' => {
                let sql = read_cstr(payload, &mut pos);
                let statements: Vec<&str> = sql
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                if statements.is_empty() {
                    message(out, b'I', b"");
                }
                for statement in statements {
                    let reply = self.run(statement, &[]).await;
                    if matches!(reply, Reply::Terminate) {
                        write_reply(out, reply, true);
                        return false;
                    }
                    let failed = matches!(reply, Reply::Error { .. });
                    write_reply(out, reply, true);
                    if failed {
                        break;
                    }
                }
                message(out, b'Z', &[self.status.byte()]);
            }
            b'P' => {
                if !self.aborted {
                    let _name = read_cstr(payload, &mut pos);
                    self.query = read_cstr(payload, &mut pos);
                    message(out, b'1', b"");
                }
            }
            b'B' => {
                if !self.aborted {
                    let _portal = read_cstr(payload, &mut pos);
                    let _stmt = read_cstr(payload, &mut pos);
                    let nformats = read_i16(payload, &mut pos);
                    pos += 2 * nformats as usize;
                    let nparams = read_i16(payload, &mut pos);
                    self.params.clear();
                    for _ in 0..nparams {
                        let len = read_i32(payload, &mut pos);
                        if len < 0 {
                            self.params.push(None);
                        } else {
                            let bytes = &payload[pos..pos + len as usize];
                            pos += len as usize;
                            self.params
                                .push(Some(String::from_utf8_lossy(bytes).into_owned()));
                        }
                    }
                    message(out, b'2', b"");
                }
            }
            b'D' => {}
            b'E' => {
                if !self.aborted {
                    let query = self.query.clone();
                    let params = self.params.clone();
                    let reply = self.run(query.trim(), &params).await;
                    if matches!(reply, Reply::Terminate) {
                        write_reply(out, reply, false);
                        return false;
                    }
                    if matches!(reply, Reply::Error { .. }) {
                        self.aborted = true;
                    }
                    write_reply(out, reply, false);
                }
            }
            b'S' => {
                self.aborted = false;
                message(out, b'Z', &[self.status.byte()]);
            }
            b'X' => return false,
            other => panic!("fake server: unexpected message {:?}", other as char),
        }
        true
    }

    fn fail(&mut self, code: &'static str, message: impl Into<String>) -> Reply {
        if self.status == Status::InTransaction {
            self.status = Status::InError;
        }
        Reply::Error {
            code,
            message: message.into(),
        }
    }

    async fn run(&mut self, sql: &str, params: &[Option<String>]) -> Reply {
        self.shared.log.lock().unwrap().push(sql.to_string());
        let upper = sql.to_uppercase();

        if sql.is_empty() {
            return Reply::Empty;
        }
        if self.shared.config.fail_on.iter().any(|p| upper.starts_with(&p.to_uppercase())) {
            return self.fail("XX000", format!("injected failure: {}", sql));
        }
        if self.status == Status::InError
            && !(upper == "COMMIT" || upper == "ROLLBACK" || upper.starts_with("ROLLBACK TO SAVEPOINT"))
        {
            return self.fail(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            );
        }

        if upper.starts_with("BEGIN") {
            self.status = Status::InTransaction;
            return Reply::Command("BEGIN".into());
        }
        if upper == "COMMIT" {
            let tag = if self.status == Status::InError { "ROLLBACK" } else { "COMMIT" };
            self.status = Status::Idle;
            return Reply::Command(tag.into());
        }
        if upper == "ROLLBACK" {
            self.status = Status::Idle;
            return Reply::Command("ROLLBACK".into());
        }
        if upper.starts_with("SAVEPOINT ") {
            if self.status == Status::Idle {
                return self.fail("25P01", "SAVEPOINT can only be used in transaction blocks");
            }
            return Reply::Command("SAVEPOINT".into());
        }
        if upper.starts_with("RELEASE SAVEPOINT ") {
            return Reply::Command("RELEASE".into());
        }
        if upper.starts_with("ROLLBACK TO SAVEPOINT ") {
            self.status = Status::InTransaction;
            return Reply::Command("ROLLBACK".into());
        }
        if let Some(gid) = upper.strip_prefix("PREPARE TRANSACTION ").map(|_| quoted(&sql[20..])) {
            if self.shared.config.disable_prepared {
                return self.fail("55000", "prepared transactions are disabled");
            }
            if self.status == Status::Idle {
                return Reply::Command("PREPARE TRANSACTION".into());
            }
            self.shared.prepared.lock().unwrap().push(gid);
            self.status = Status::Idle;
            return Reply::Command("PREPARE TRANSACTION".into());
        }
        for (prefix, tag) in [("COMMIT PREPARED ", "COMMIT PREPARED"), ("ROLLBACK PREPARED ", "ROLLBACK PREPARED")] {
            if upper.starts_with(prefix) {
                if self.status != Status::Idle {
                    return self.fail("25001", format!("{} cannot run inside a transaction block", tag));
                }
                let gid = quoted(&sql[prefix.len()..]);
                let mut prepared = self.shared.prepared.lock().unwrap();
                let Some(index) = prepared.iter().position(|g| *g == gid) else {
                    drop(prepared);
                    return self.fail("42704", format!("prepared transaction with identifier \"{}\" does not exist", gid));
                };
                prepared.remove(index);
                return Reply::Command(tag.into());
            }
        }
        if upper.contains("FROM PG_PREPARED_XACTS") {
            let rows = self
                .shared
                .prepared
                .lock()
                .unwrap()
                .iter()
                .map(|gid| {
                    vec![
                        Some(gid.clone()),
                        Some("2024-01-01 00:00:00+00".to_string()),
                        Some("tester".to_string()),
                        Some("testdb".to_string()),
                    ]
                })
                .collect::<Vec<_>>();
            let tag = format!("SELECT {}", rows.len());
            return Reply::Rows {
                columns: ["gid", "prepared", "owner", "database"].map(String::from).to_vec(),
                rows,
                tag,
            };
        }
        if let Some(rest) = upper.strip_prefix("SELECT PG_SLEEP(") {
            let secs: f64 = rest.trim_end_matches(')').parse().unwrap_or(1.0);
            let cancel = self.cancel.clone();
            let canceled = tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => false,
                _ = cancel.notified() => true,
            };
            if canceled {
                return self.fail("57014", "canceling statement due to user request");
            }
            return Reply::Rows {
                columns: vec!["pg_sleep".into()],
                rows: vec![vec![Some(String::new())]],
                tag: "SELECT 1".into(),
            };
        }
        if let Some(channel) = upper.strip_prefix("LISTEN ").map(|_| sql[7..].trim().to_string()) {
            self.shared
                .listeners
                .lock()
                .unwrap()
                .entry(channel)
                .or_default()
                .push((self.pid, self.notify_tx.clone()));
            return Reply::Command("LISTEN".into());
        }
        if upper.starts_with("NOTIFY ") {
            let rest = &sql[7..];
            let (channel, payload) = match rest.split_once(',') {
                Some((channel, payload)) => (channel.trim().to_string(), quoted(payload)),
                None => (rest.trim().to_string(), String::new()),
            };
            if let Some(senders) = self.shared.listeners.lock().unwrap().get(&channel) {
                for (_, sender) in senders {
                    let _ = sender.send((self.pid, channel.clone(), payload.clone()));
                }
            }
            return Reply::Command("NOTIFY".into());
        }
        if upper.starts_with("SELECT PG_NOTIFY(") {
            let args = sql[17..].trim_end().trim_end_matches(')');
            let (channel, payload) = args.split_once(',').unwrap_or((args, "''"));
            self.split = Some(notification_frame(self.pid, &quoted(channel), &quoted(payload)));
            return Reply::Rows {
                columns: vec!["pg_notify".into()],
                rows: vec![vec![Some(String::new())]],
                tag: "SELECT 1".into(),
            };
        }
        if upper.starts_with("SELECT PG_TERMINATE_BACKEND") {
            return Reply::Terminate;
        }
        if upper == "SELECT 1/0" {
            return self.fail("22012", "division by zero");
        }
        if upper == "SELECT $1" {
            return Reply::Rows {
                columns: vec!["?column?".into()],
                rows: vec![vec![params.first().cloned().flatten()]],
                tag: "SELECT 1".into(),
            };
        }
        if let Some(value) = upper.strip_prefix("SELECT ").filter(|v| v.parse::<i64>().is_ok()) {
            return Reply::Rows {
                columns: vec!["?column?".into()],
                rows: vec![vec![Some(value.to_string())]],
                tag: "SELECT 1".into(),
            };
        }

        let first = upper.split_whitespace().next().unwrap_or_default();
        let tag = match first {
            "INSERT" => "INSERT 0 1".to_string(),
            "UPDATE" | "DELETE" => format!("{} 1", first),
            "CREATE" | "DROP" => upper.split_whitespace().take(2).collect::<Vec<_>>().join(" "),
            other => other.to_string(),
        };
        Reply::Command(tag)
    }
}

fn write_reply(out: &mut Vec<u8>, reply: Reply, simple: bool) {
    match reply {
        Reply::Rows { columns, rows, tag } => {
            let mut body = (columns.len() as i16).to_be_bytes().to_vec();
            for column in &columns {
                cstr(&mut body, column);
                body.extend_from_slice(&0u32.to_be_bytes()); // table oid
                body.extend_from_slice(&0i16.to_be_bytes()); // attnum
                body.extend_from_slice(&25u32.to_be_bytes()); // type oid
                body.extend_from_slice(&(-1i16).to_be_bytes()); // typlen
                body.extend_from_slice(&(-1i32).to_be_bytes()); // typmod
                body.extend_from_slice(&0i16.to_be_bytes()); // format
            }
            message(out, b'T', &body);
            for row in rows {
                let mut body = (row.len() as i16).to_be_bytes().to_vec();
                for value in row {
                    match value {
                        Some(v) => {
                            body.extend_from_slice(&(v.len() as i32).to_be_bytes());
                            body.extend_from_slice(v.as_bytes());
                        }
                        None => body.extend_from_slice(&(-1i32).to_be_bytes()),
                    }
                }
                message(out, b'D', &body);
            }
            let mut body = Vec::new();
            cstr(&mut body, &tag);
            message(out, b'C', &body);
        }
        Reply::Command(tag) => {
            if !simple {
                message(out, b'n', b"");
            }
            let mut body = Vec::new();
            cstr(&mut body, &tag);
            message(out, b'C', &body);
        }
        Reply::Empty => {
            if !simple {
                message(out, b'n', b"");
            }
            message(out, b'I', b"");
        }
        Reply::Error { code, message: text } => {
            message(out, b'E', &error_body("ERROR", code, &text));
        }
        Reply::Terminate => {
            message(
                out,
                b'E',
                &error_body("FATAL", "57P01", "terminating connection due to administrator command"),
            );
        }
    }
}
