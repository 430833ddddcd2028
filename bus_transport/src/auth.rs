//! Authentication conversation.
//!
//! A small line based handshake run before any message is exchanged. Lines are
//! terminated by `\r\n`.
//!
//! ```text
//! client                              server
//!   AUTH EXTERNAL <hex(uid)>  ───────►
//!                             ◄───────  OK            (or REJECTED EXTERNAL)
//!   BEGIN                     ───────►
//!   <messages...>             ◄──────►  <messages...>
//! ```
//!
//! The conversation never touches a socket. The transport feeds it received bytes,
//! writes out what it wants to send and asks [`Auth::do_work`] how to proceed.

use std::fmt;

/// Which side of the conversation a transport plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// What the conversation needs next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    WaitingForInput,
    HaveBytesToSend,
    /// The peer was rejected or misbehaved; drop the link.
    NeedDisconnect,
    Authenticated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Phase {
    ClientStart,
    ClientWaitingForOk,
    ServerWaitingForAuth,
    ServerWaitingForBegin,
    Authenticated,
    Failed(String),
}

const CRLF: &[u8] = b"\r\n";

/// Incremental authentication state machine for one side of a link.
#[derive(Debug)]
pub struct Auth {
    role: Role,
    phase: Phase,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    max_line: usize,
    uid: u32,
    peer_uid: Option<u32>,
}

impl Auth {
    pub fn new(role: Role, max_line: usize) -> Self {
        let phase = match role {
            Role::Client => Phase::ClientStart,
            Role::Server => Phase::ServerWaitingForAuth,
        };
        Auth {
            role,
            phase,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            max_line,
            uid: current_uid(),
            peer_uid: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Credentials of the peer as reported by the operating system.
    ///
    /// A server only accepts a claimed uid matching these. Without them it
    /// accepts its own uid.
    pub fn set_peer_uid(&mut self, uid: Option<u32>) {
        self.peer_uid = uid;
    }

    /// Advance the conversation as far as the buffered input allows.
    pub fn do_work(&mut self) -> AuthState {
        if self.phase == Phase::ClientStart {
            self.queue_line(&format!("AUTH EXTERNAL {}", hex_encode(&self.uid.to_string())));
            self.phase = Phase::ClientWaitingForOk;
        }

        while self.wants_input() {
            match self.next_line() {
                Some(line) => self.process_line(&line),
                None => break,
            }
        }

        if !self.outgoing.is_empty() {
            return AuthState::HaveBytesToSend;
        }

        match self.phase {
            Phase::Authenticated => AuthState::Authenticated,
            Phase::Failed(_) => AuthState::NeedDisconnect,
            _ => AuthState::WaitingForInput,
        }
    }

    /// Bytes the conversation wants written to the peer.
    pub fn bytes_to_send(&self) -> &[u8] {
        &self.outgoing
    }

    /// Record that the first `n` bytes of [`Auth::bytes_to_send`] were written.
    pub fn bytes_sent(&mut self, n: usize) {
        let n = n.min(self.outgoing.len());
        self.outgoing.drain(..n);
    }

    /// Feed bytes read from the peer.
    pub fn bytes_received(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Bytes that arrived after the handshake finished.
    ///
    /// They belong to the message stream. Empty until authenticated.
    pub fn take_unused_bytes(&mut self) -> Vec<u8> {
        if self.phase != Phase::Authenticated {
            return Vec::new();
        }
        std::mem::take(&mut self.incoming)
    }

    /// Why the handshake failed, if it did.
    pub fn failure(&self) -> Option<&str> {
        match &self.phase {
            Phase::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    fn wants_input(&self) -> bool {
        matches!(
            self.phase,
            Phase::ClientWaitingForOk | Phase::ServerWaitingForAuth | Phase::ServerWaitingForBegin
        )
    }

    fn next_line(&mut self) -> Option<String> {
        match self.incoming.windows(CRLF.len()).position(|w| w == CRLF) {
            Some(pos) if pos <= self.max_line => {
                let line: Vec<u8> = self.incoming.drain(..pos + CRLF.len()).take(pos).collect();
                match String::from_utf8(line) {
                    Ok(line) => Some(line),
                    Err(_) => {
                        self.fail("authentication line is not valid UTF-8".into());
                        None
                    }
                }
            }
            Some(_) => {
                self.fail(format!("authentication line longer than {}", self.max_line));
                None
            }
            None if self.incoming.len() > self.max_line => {
                self.fail(format!("authentication line longer than {}", self.max_line));
                None
            }
            None => None,
        }
    }

    fn process_line(&mut self, line: &str) {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or("");

        match (self.phase.clone(), command) {
            (Phase::ClientWaitingForOk, "OK") => {
                self.queue_line("BEGIN");
                self.phase = Phase::Authenticated;
            }
            (Phase::ClientWaitingForOk, "REJECTED") => {
                self.fail("server rejected our credentials".into());
            }
            (Phase::ServerWaitingForAuth, "AUTH") => {
                let mechanism = words.next();
                let claimed = words.next().and_then(hex_decode);
                self.check_external(mechanism, claimed.as_deref());
            }
            (Phase::ServerWaitingForBegin, "BEGIN") => {
                self.phase = Phase::Authenticated;
            }
            (_, _) => {
                if self.role == Role::Server {
                    self.queue_line("ERROR");
                }
                self.fail(format!("unexpected authentication command '{}'", command));
            }
        }
    }

    fn check_external(&mut self, mechanism: Option<&str>, claimed: Option<&str>) {
        let expected = self.peer_uid.unwrap_or(self.uid);

        match (mechanism, claimed.and_then(|c| c.parse::<u32>().ok())) {
            (Some("EXTERNAL"), Some(uid)) if uid == expected => {
                tracing::debug!(uid, "peer authenticated");
                self.queue_line("OK");
                self.phase = Phase::ServerWaitingForBegin;
            }
            (Some("EXTERNAL"), claimed) => {
                tracing::warn!(?claimed, expected, "rejecting peer credentials");
                self.queue_line("REJECTED EXTERNAL");
                self.fail(format!("peer claimed uid {:?}, expected {}", claimed, expected));
            }
            (mechanism, _) => {
                self.queue_line("REJECTED EXTERNAL");
                self.fail(format!("unsupported mechanism {:?}", mechanism));
            }
        }
    }

    fn queue_line(&mut self, line: &str) {
        self.outgoing.extend_from_slice(line.as_bytes());
        self.outgoing.extend_from_slice(CRLF);
    }

    fn fail(&mut self, reason: String) {
        tracing::debug!(role = %self.role, %reason, "authentication failed");
        self.phase = Phase::Failed(reason);
    }
}

fn current_uid() -> u32 {
    unsafe { libc::getuid() as u32 }
}

fn hex_encode(s: &str) -> String {
    s.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<String> {
    if s.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
