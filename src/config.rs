use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_TRACK: usize = 1024;

/// Immutable startup configuration.
///
/// The file is line-oriented: `#` starts a comment to end-of-line, tokens are
/// separated by whitespace. Unknown directives are ignored so a config can be
/// shared with newer versions of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Local address of the outward endpoint (`listen HOST:PORT`, `*` = wildcard).
    pub listen: Option<String>,
    /// Peer address of the outward endpoint (`forward HOST:PORT`); absent
    /// means the peer is learned from the first received datagram.
    pub forward: Option<String>,
    /// One entry per `relay local HOST:PORT remote HOST:PORT` line.
    pub relays: Vec<RelayConfig>,
    /// Dedup window size (`track N`).
    pub track: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read `{}`", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: `track` must be a positive integer")]
    InvalidTrack { line: usize },
    #[error("an outward address is required: set `listen`, `forward`, or both")]
    MissingOutwardAddress,
    #[error("at least one `relay` with both `local` and `remote` addresses is required")]
    NoRelays,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_owned(),
            source,
        })?;

        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut listen = None;
        let mut forward = None;
        let mut relays = Vec::new();
        let mut track = DEFAULT_TRACK;

        for (idx, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default();
            let mut tokens = line.split_whitespace();

            let Some(directive) = tokens.next() else {
                continue;
            };

            match directive {
                "listen" => {
                    if let Some(arg) = tokens.next() {
                        listen = Some(arg.to_owned());
                    }
                }
                "forward" => {
                    if let Some(arg) = tokens.next() {
                        forward = Some(arg.to_owned());
                    }
                }
                "track" => {
                    let Some(arg) = tokens.next() else {
                        continue;
                    };

                    track = arg
                        .parse()
                        .ok()
                        .filter(|&n| n > 0)
                        .ok_or(Error::InvalidTrack { line: idx + 1 })?;
                }
                "relay" => {
                    let mut local = None;
                    let mut remote = None;

                    while let Some(key) = tokens.next() {
                        let slot = match key {
                            "local" => &mut local,
                            "remote" => &mut remote,
                            _ => continue,
                        };

                        let Some(addr) = tokens.next() else {
                            break;
                        };

                        *slot = Some(addr.to_owned());
                    }

                    match (local, remote) {
                        (Some(local), Some(remote)) => relays.push(RelayConfig { local, remote }),
                        _ => tracing::warn!(
                            line = idx + 1,
                            "Ignoring `relay` without both `local` and `remote`"
                        ),
                    }
                }
                _ => {}
            }
        }

        if listen.is_none() && forward.is_none() {
            return Err(Error::MissingOutwardAddress);
        }

        if relays.is_empty() {
            return Err(Error::NoRelays);
        }

        Ok(Config {
            listen,
            forward,
            relays,
            track,
        })
    }
}
