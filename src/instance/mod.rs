use std::fmt;
use std::net::TcpListener;
use std::path::PathBuf;

use crate::error::ProxyError;

/// Well-known socket filename PostgreSQL clients expect inside the
/// per-instance directory.
pub const POSTGRES_SOCKET_NAME: &str = ".s.PGSQL.5432";

/// A logical instance identifier of the form `project:region:name`.
///
/// The legacy two-part shape `project:name` is tolerated (empty region), and
/// a fully qualified project may contain one embedded `.`, in which case the
/// first two colon-separated tokens are rejoined into the project component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    pub project: String,
    pub region: String,
    pub name: String,
}

impl InstanceName {
    /// Split an identifier into its (project, region, name) components.
    ///
    /// Total: never fails. Malformed input yields empty components, which
    /// [`InstanceName::parse`] rejects.
    pub fn split(s: &str) -> (String, String, String) {
        let mut parts: Vec<&str> = s.split(':').collect();
        let mut project = String::new();

        // A fully qualified project ("google.com:project") consumes the
        // first two tokens.
        if parts.len() > 1 && parts[0].contains('.') {
            project = format!("{}:{}", parts[0], parts[1]);
            parts.drain(..2);
        } else if !parts.is_empty() {
            project = parts.remove(0).to_string();
        }

        match parts.len() {
            2 => (project, parts[0].to_string(), parts[1].to_string()),
            1 => (project, String::new(), parts[0].to_string()),
            0 => (String::new(), String::new(), project),
            _ => (String::new(), String::new(), String::new()),
        }
    }

    /// Parse an identifier, rejecting shapes with an empty project or name.
    pub fn parse(s: &str) -> Result<InstanceName, ProxyError> {
        let (project, region, name) = Self::split(s);
        if project.is_empty() || name.is_empty() {
            return Err(ProxyError::config(format!(
                "invalid instance connection name {:?}, expected project:region:name",
                s
            )));
        }
        Ok(InstanceName {
            project,
            region,
            name,
        })
    }

    /// The identifier the remote instance presents in its server certificate:
    /// the region-stripped `project:name` form.
    pub fn server_name(&self) -> String {
        format!("{}:{}", self.project, self.name)
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.region.is_empty() {
            write!(f, "{}:{}", self.project, self.name)
        } else {
            write!(f, "{}:{}:{}", self.project, self.region, self.name)
        }
    }
}

/// Local endpoint networks a listener can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Unix,
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Unix => "unix",
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }
}

/// Where a listener should bind, as far as parsing alone can decide.
///
/// The default unix path depends on the database version reported by the
/// control plane (PostgreSQL instances get a directory plus the well-known
/// socket filename), so it is resolved by the listener manager at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `unix`, path derived from the socket dir and instance name.
    UnixDefault,
    /// `=unix:<name-or-absolute-path>` override.
    UnixPath(PathBuf),
    /// Any of the tcp networks, fully resolved `host:port`.
    Tcp(String),
}

/// A parsed listener descriptor for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub instance: InstanceName,
    pub network: Network,
    pub addr: ListenAddr,
}

/// Which networks this host supports, probed once at startup.
///
/// `tcp4`/`tcp6` are probed with a zero-port loopback bind; the `tcp` alias
/// resolves to whichever loopback address was found first.
#[derive(Debug, Clone)]
pub struct NetProbe {
    pub unix: bool,
    pub tcp4: bool,
    pub tcp6: bool,
}

impl NetProbe {
    pub fn probe() -> NetProbe {
        NetProbe {
            unix: cfg!(unix),
            tcp4: TcpListener::bind(("127.0.0.1", 0)).is_ok(),
            tcp6: TcpListener::bind(("::1", 0)).is_ok(),
        }
    }

    /// Loopback host literal for the given tcp network, if supported.
    pub fn loopback(&self, network: Network) -> Option<&'static str> {
        match network {
            Network::Tcp4 => self.tcp4.then_some("127.0.0.1"),
            Network::Tcp6 => self.tcp6.then_some("[::1]"),
            Network::Tcp => self
                .loopback(Network::Tcp4)
                .or_else(|| self.loopback(Network::Tcp6)),
            Network::Unix => None,
        }
    }

    fn supports(&self, network: Network) -> bool {
        match network {
            Network::Unix => self.unix,
            Network::Tcp4 => self.tcp4,
            Network::Tcp6 => self.tcp6,
            Network::Tcp => self.tcp4 || self.tcp6,
        }
    }
}

impl ListenerSpec {
    /// Parse one raw `--instances` entry.
    ///
    /// Grammar: `<instance>[=<network>:<address>]` where the suffix is
    /// `tcp:<port>` (loopback), `tcp:<host>:<port>`, or
    /// `unix:<name-or-absolute-path>`. Without a suffix the listener is a
    /// unix socket under the configured directory.
    pub fn parse(raw: &str, probe: &NetProbe) -> Result<ListenerSpec, ProxyError> {
        let (instance_part, override_part) = match raw.split_once('=') {
            Some((i, o)) => (i, Some(o)),
            None => (raw, None),
        };
        let instance = InstanceName::parse(instance_part)?;

        let Some(spec) = override_part else {
            if !probe.unix {
                return Err(ProxyError::config(format!(
                    "instance {} requires a unix socket, unsupported on this platform",
                    instance
                )));
            }
            return Ok(ListenerSpec {
                instance,
                network: Network::Unix,
                addr: ListenAddr::UnixDefault,
            });
        };

        let Some((network_str, rest)) = spec.split_once(':') else {
            return Err(ProxyError::config(format!(
                "invalid listener override {:?} for instance {}, expected network:address",
                spec, instance
            )));
        };

        let network = match network_str {
            "unix" => Network::Unix,
            "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            other => {
                return Err(ProxyError::config(format!(
                    "unknown network {:?} for instance {}",
                    other, instance
                )));
            }
        };
        if !probe.supports(network) {
            return Err(ProxyError::config(format!(
                "network {:?} is not available on this host (instance {})",
                network.as_str(),
                instance
            )));
        }

        let addr = match network {
            Network::Unix => ListenAddr::UnixPath(PathBuf::from(rest)),
            _ => {
                let pieces: Vec<&str> = rest.split(':').collect();
                match pieces.as_slice() {
                    [port] => {
                        port.parse::<u16>().map_err(|_| {
                            ProxyError::config(format!(
                                "invalid port {:?} for instance {}",
                                port, instance
                            ))
                        })?;
                        let host = probe.loopback(network).ok_or_else(|| {
                            ProxyError::config(format!(
                                "no loopback address for network {:?}",
                                network.as_str()
                            ))
                        })?;
                        ListenAddr::Tcp(format!("{}:{}", host, port))
                    }
                    [host, port] => {
                        port.parse::<u16>().map_err(|_| {
                            ProxyError::config(format!(
                                "invalid port {:?} for instance {}",
                                port, instance
                            ))
                        })?;
                        ListenAddr::Tcp(format!("{}:{}", host, port))
                    }
                    _ => {
                        return Err(ProxyError::config(format!(
                            "invalid listener address {:?} for instance {}",
                            rest, instance
                        )));
                    }
                }
            }
        };

        Ok(ListenerSpec {
            instance,
            network,
            addr,
        })
    }
}

/// Parse an update-stream message: a comma-separated instance list.
/// Empty and whitespace-only entries are skipped; duplicates collapse.
pub fn parse_instance_list(msg: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    msg.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(|s| s.to_string())
        .collect()
}
