//! Wire grammar for the dispatcher control plane.
//!
//! Every request is a single text line: whitespace-separated fields with a
//! case-insensitive command token. The server answers with one line and
//! closes the connection. Anything that does not parse is answered `ERR`
//! without touching state.

use std::fmt;

/// A runner's identity: the address it accepts `RUN` offers on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerKey {
    pub host: String,
    pub port: u16,
}

impl RunnerKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address usable with `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Register(RunnerKey),
    Heartbeat(RunnerKey),
    Dispatch {
        revision: String,
    },
    /// `seconds` is kept verbatim: the dispatcher validates that it looks
    /// like a number but echoes the original text into the result file.
    Result {
        revision: String,
        status: String,
        seconds: String,
    },
}

impl Command {
    /// Parses one request line. `None` means the caller replies `ERR`.
    pub fn parse(line: &str) -> Option<Command> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (command, args) = fields.split_first()?;
        match (command.to_ascii_uppercase().as_str(), args) {
            ("STATUS", []) => Some(Command::Status),
            ("REGISTER", [host, port]) => {
                Some(Command::Register(RunnerKey::new(*host, port.parse().ok()?)))
            }
            ("HEARTBEAT", [host, port]) => {
                Some(Command::Heartbeat(RunnerKey::new(*host, port.parse().ok()?)))
            }
            ("DISPATCH", [revision]) => Some(Command::Dispatch {
                revision: (*revision).to_string(),
            }),
            ("RESULT", [revision, status, seconds]) => {
                seconds.parse::<f64>().ok()?;
                Some(Command::Result {
                    revision: (*revision).to_string(),
                    status: (*status).to_string(),
                    seconds: (*seconds).to_string(),
                })
            }
            _ => None,
        }
    }
}

/// A reply line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status {
        runners: usize,
        pending: usize,
        assigned: usize,
    },
    Registered,
    Alive,
    Queued,
    Ack,
    Err,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status {
                runners,
                pending,
                assigned,
            } => write!(
                f,
                "OK RUNNERS {} PENDING {} ASSIGNED {}",
                runners, pending, assigned
            ),
            Reply::Registered => write!(f, "REGISTERED"),
            Reply::Alive => write!(f, "ALIVE"),
            Reply::Queued => write!(f, "QUEUED"),
            Reply::Ack => write!(f, "ACK"),
            Reply::Err => write!(f, "ERR"),
        }
    }
}
