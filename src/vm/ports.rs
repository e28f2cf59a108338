//! Host port plan for the guest services forwarded over QEMU user networking.

use std::fmt;

use serde::Serialize;

use crate::config::PreferenceValues;
use crate::error::{Error, Result};

/// A guest service with a host-side forward.
///
/// The declaration order is the order of the `hostfwd` clauses on the
/// command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Ssh,
    P5678,
    P5700,
    P6379,
    P9000,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Service::Ssh,
        Service::P5678,
        Service::P5700,
        Service::P6379,
        Service::P9000,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Service::Ssh => "ssh",
            Service::P5678 => "p5678",
            Service::P5700 => "p5700",
            Service::P6379 => "p6379",
            Service::P9000 => "p9000",
        }
    }

    /// TCP port the service listens on inside the guest.
    pub fn guest_port(self) -> u16 {
        match self {
            Service::Ssh => 22,
            Service::P5678 => 5678,
            Service::P5700 => 5700,
            Service::P6379 => 6379,
            Service::P9000 => 9000,
        }
    }

    pub fn default_host_port(self) -> u16 {
        match self {
            Service::Ssh => 8022,
            other => other.guest_port(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated host ports, one per [`Service`], all distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMap {
    ports: [u16; 5],
}

impl Default for PortMap {
    fn default() -> Self {
        Self {
            ports: Service::ALL.map(Service::default_host_port),
        }
    }
}

impl PortMap {
    /// Resolve the port plan from stored preferences.
    pub fn resolve(values: &PreferenceValues) -> Result<Self> {
        Self::from_entries(Service::ALL.map(|s| (s, values.port(s))))
    }

    /// Build from raw `(service, port)` entries, one per service, in any order.
    ///
    /// A collision names the services in entry order.
    pub fn from_entries(entries: [(Service, i32); 5]) -> Result<Self> {
        let mut assigned: [Option<u16>; 5] = [None; 5];
        let mut seen: Vec<Service> = Vec::with_capacity(entries.len());
        for (service, raw) in entries {
            if assigned[service as usize].is_some() {
                return Err(Error::DuplicateService {
                    service: service.name(),
                });
            }
            let port = u16::try_from(raw)
                .ok()
                .filter(|p| *p != 0)
                .ok_or(Error::InvalidPort {
                    service: service.name(),
                    value: raw,
                })?;

            if let Some(earlier) = seen.iter().find(|s| assigned[**s as usize] == Some(port)) {
                return Err(Error::PortCollision {
                    port,
                    first: earlier.name(),
                    second: service.name(),
                });
            }
            assigned[service as usize] = Some(port);
            seen.push(service);
        }
        // Five distinct services fill all five slots.
        Ok(Self {
            ports: assigned.map(|p| p.unwrap_or_default()),
        })
    }

    pub fn host_port(&self, service: Service) -> u16 {
        self.ports[service as usize]
    }

    /// `(service, host_port)` pairs in forward order.
    pub fn iter(&self) -> impl Iterator<Item = (Service, u16)> + '_ {
        Service::ALL.into_iter().zip(self.ports)
    }

    /// Whether `port` is the host side of one of the forwards.
    pub fn is_forwarded_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// `hostfwd=tcp::<host>-:<guest>` clauses in forward order.
    pub fn hostfwd_clauses(&self) -> Vec<String> {
        self.iter()
            .map(|(service, host)| format!("hostfwd=tcp::{}-:{}", host, service.guest_port()))
            .collect()
    }

    /// Human-readable forward summary, e.g. `SSH: 8022, Port 5678, ...`.
    pub fn summary(&self) -> String {
        self.iter()
            .map(|(service, host)| match service {
                Service::Ssh => format!("SSH: {host}"),
                _ => format!("Port {host}"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `ssh://<user>@127.0.0.1:<port>/#vShell`
    pub fn ssh_uri(&self, user: &str) -> String {
        format!(
            "ssh://{}@127.0.0.1:{}/#{}",
            user,
            self.host_port(Service::Ssh),
            crate::vm::PROGRAM_NAME
        )
    }
}
