//! Domain types shared by the launcher, the server, and the registry.
//!
//! All path fields use `PathBuf`; all types round-trip through serde so the
//! registry and the wire protocol can carry them unchanged.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Roles and identities
// ---------------------------------------------------------------------------

/// Which tier of the two-tier topology a server belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Outer execution server: runs scripts, owns the artifact cache.
    Primary,
    /// Inner compiler-host server: keeps a warm compiler session.
    Compiler,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Primary, Role::Compiler];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Compiler => "compiler",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Role::Primary),
            "compiler" => Ok(Role::Compiler),
            other => Err(format!(
                "unknown server role '{other}'; expected: primary, compiler"
            )),
        }
    }
}

/// Stable address of one controllable server instance.
///
/// Derived from the installation root, the user, and the role, so two
/// installations (or two users) never talk to each other's servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub role: Role,
    pub name: String,
}

impl ChannelIdentity {
    pub fn derive(role: Role, root: &Path, user: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(root.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(user.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self {
            role,
            name: format!("{}-{}", role, &digest[..12]),
        }
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Server records
// ---------------------------------------------------------------------------

/// Lifecycle state of a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    #[default]
    Starting,
    Ready,
    Draining,
    Dead,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessState::Starting => write!(f, "starting"),
            LivenessState::Ready => write!(f, "ready"),
            LivenessState::Draining => write!(f, "draining"),
            LivenessState::Dead => write!(f, "dead"),
        }
    }
}

/// Durable record of a server that claims an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub identity: ChannelIdentity,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub state: LivenessState,
    pub socket: PathBuf,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// What the launcher was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Run,
    Start,
    Stop,
    Restart,
    Ping,
    Reset,
    Add,
    Remove,
    Status,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Run => "run",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Restart => "restart",
            Command::Ping => "ping",
            Command::Reset => "reset",
            Command::Add => "add",
            Command::Remove => "remove",
            Command::Status => "status",
        };
        f.write_str(name)
    }
}

/// Which identities a lifecycle command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Targets {
    Primary,
    Compiler,
    Both,
}

impl Targets {
    pub fn roles(self) -> &'static [Role] {
        match self {
            Targets::Primary => &[Role::Primary],
            Targets::Compiler => &[Role::Compiler],
            Targets::Both => &Role::ALL,
        }
    }
}
