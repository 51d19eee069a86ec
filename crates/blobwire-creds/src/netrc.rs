//! `.netrc` parsing and the netrc-backed credential helper.
//!
//! # Design
//! - Tokens are whitespace separated; `macdef` bodies run to the next blank
//!   line and are ignored.
//! - A named `machine` entry beats the `default` entry.
//! - A rejected netrc credential disables netrc for that host until a later
//!   netrc credential for the host is approved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blobwire_config::ConfigMap;
use tracing::{debug, warn};

use crate::creds::{Creds, HOST, PASSWORD, PATH, PROTOCOL, SOURCE, USERNAME};
use crate::error::{CredsError, CredsResult};
use crate::helper::{CredentialHelper, Disposition};

/// Value of the `source` field on credentials produced from netrc.
const NETRC_SOURCE: &str = "netrc";

#[cfg(windows)]
const NETRC_BASENAME: &str = "_netrc";
#[cfg(not(windows))]
const NETRC_BASENAME: &str = ".netrc";

/// One `machine` (or `default`) entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetrcMachine {
    /// Host name; empty for the `default` entry.
    pub name: String,
    /// `login` value.
    pub login: String,
    /// `password` value.
    pub password: String,
    /// `account` value.
    pub account: String,
}

/// Lookup of netrc entries by host name.
pub trait NetrcFinder: Send + Sync {
    /// Entry for `host`, falling back to the default entry.
    fn find_machine(&self, host: &str) -> Option<NetrcMachine>;
}

/// Parsed netrc file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Netrc {
    machines: Vec<NetrcMachine>,
    default: Option<NetrcMachine>,
}

impl Netrc {
    /// Parse netrc syntax.
    ///
    /// # Errors
    ///
    /// Returns an error when a keyword is missing its value.
    pub fn parse(contents: &str) -> CredsResult<Self> {
        let mut netrc = Self::default();
        let mut current: Option<NetrcMachine> = None;
        let mut lines = contents.lines();

        while let Some(line) = lines.next() {
            let mut tokens = line.split_whitespace();
            while let Some(token) = tokens.next() {
                match token {
                    "machine" => {
                        netrc.finish(current.take());
                        let name = required(tokens.next(), token)?;
                        current = Some(NetrcMachine {
                            name: name.to_string(),
                            ..NetrcMachine::default()
                        });
                    }
                    "default" => {
                        netrc.finish(current.take());
                        current = Some(NetrcMachine::default());
                    }
                    "login" | "password" | "account" => {
                        let value = required(tokens.next(), token)?.to_string();
                        if let Some(machine) = current.as_mut() {
                            match token {
                                "login" => machine.login = value,
                                "password" => machine.password = value,
                                _ => machine.account = value,
                            }
                        }
                    }
                    "macdef" => {
                        required(tokens.next(), token)?;
                        for body in lines.by_ref() {
                            if body.trim().is_empty() {
                                break;
                            }
                        }
                        break;
                    }
                    _ if token.starts_with('#') => break,
                    _ => {}
                }
            }
        }
        netrc.finish(current);
        Ok(netrc)
    }

    /// Read and parse the netrc file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> CredsResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| CredsError::NetrcRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Locate the netrc file under `HOME`.
    ///
    /// Returns an empty netrc when `HOME` is unset or the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be read or parsed.
    pub fn from_environment(os: &ConfigMap) -> CredsResult<(Self, Option<PathBuf>)> {
        let Some(home) = os.get("HOME").filter(|home| !home.is_empty()) else {
            return Ok((Self::default(), None));
        };
        let path = Path::new(home).join(NETRC_BASENAME);
        if !path.is_file() {
            return Ok((Self::default(), Some(path)));
        }
        let netrc = Self::from_file(&path)?;
        Ok((netrc, Some(path)))
    }

    fn finish(&mut self, machine: Option<NetrcMachine>) {
        match machine {
            Some(machine) if machine.name.is_empty() => self.default = Some(machine),
            Some(machine) => self.machines.push(machine),
            None => {}
        }
    }
}

impl NetrcFinder for Netrc {
    fn find_machine(&self, host: &str) -> Option<NetrcMachine> {
        self.machines
            .iter()
            .find(|machine| machine.name == host)
            .or(self.default.as_ref())
            .cloned()
    }
}

fn required<'a>(value: Option<&'a str>, token: &str) -> CredsResult<&'a str> {
    value.ok_or_else(|| CredsError::NetrcSyntax {
        token: token.to_string(),
    })
}

/// Strip a `:port` suffix from a `host[:port]` credential field.
///
/// Bracketed IPv6 literals keep their address without brackets.
#[must_use]
pub fn netrc_hostname(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[')
        && let Some((address, _)) = rest.split_once(']')
    {
        return address;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Credential helper answering from a netrc file.
pub struct NetrcCredentialHelper {
    finder: Arc<dyn NetrcFinder>,
    skip: Mutex<HashMap<String, bool>>,
}

impl std::fmt::Debug for NetrcCredentialHelper {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("NetrcCredentialHelper")
            .finish_non_exhaustive()
    }
}

impl NetrcCredentialHelper {
    /// Helper backed by `finder`.
    #[must_use]
    pub fn new(finder: Arc<dyn NetrcFinder>) -> Self {
        Self {
            finder,
            skip: Mutex::new(HashMap::new()),
        }
    }

    /// Helper backed by `$HOME/.netrc`; `None` when the file is unreadable.
    #[must_use]
    pub fn from_environment(os: &ConfigMap) -> Option<Self> {
        match Netrc::from_environment(os) {
            Ok((netrc, _)) => Some(Self::new(Arc::new(netrc))),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable netrc file");
                None
            }
        }
    }

    fn set_skip(&self, host: &str, skip: bool) {
        if let Ok(mut hosts) = self.skip.lock() {
            hosts.insert(host.to_string(), skip);
        }
    }

    fn skipped(&self, host: &str) -> bool {
        self.skip
            .lock()
            .map(|hosts| hosts.get(host).copied().unwrap_or(false))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CredentialHelper for NetrcCredentialHelper {
    async fn fill(&self, input: &Creds) -> CredsResult<Option<Creds>> {
        let host = netrc_hostname(input.first(HOST));
        if host.is_empty() || self.skipped(host) {
            return Ok(None);
        }
        let Some(machine) = self.finder.find_machine(host) else {
            return Ok(None);
        };

        debug!(
            protocol = input.first(PROTOCOL),
            host = input.first(HOST),
            path = input.first(PATH),
            "netrc credential fill"
        );
        let mut creds = Creds::new();
        creds.set(USERNAME, machine.login);
        creds.set(PASSWORD, machine.password);
        for key in [PROTOCOL, HOST, PATH, "scheme"] {
            creds.set_all(key, input.all(key));
        }
        creds.set(SOURCE, NETRC_SOURCE);
        Ok(Some(creds))
    }

    async fn approve(&self, creds: &Creds) -> CredsResult<Disposition> {
        if creds.first(SOURCE) != NETRC_SOURCE {
            return Ok(Disposition::Passed);
        }
        self.set_skip(netrc_hostname(creds.first(HOST)), false);
        Ok(Disposition::Handled)
    }

    async fn reject(&self, creds: &Creds) -> CredsResult<Disposition> {
        if creds.first(SOURCE) != NETRC_SOURCE {
            return Ok(Disposition::Passed);
        }
        debug!(host = creds.first(HOST), "netrc credential rejected");
        self.set_skip(netrc_hostname(creds.first(HOST)), true);
        Ok(Disposition::Handled)
    }
}
