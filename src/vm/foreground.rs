//! Foreground keep-alive: the user-visible status line and the paired
//! wake/wifi holds that keep the host from sleeping under a running VM.

use std::net::{IpAddr, UdpSocket};

use tracing::{debug, info, warn};

use crate::vm::PortMap;

pub const NOT_INITIALIZED: &str = "Virtual machine is not initialized.";

// ---------------------------------------------------------------------------
// Status sink
// ---------------------------------------------------------------------------

/// Process-wide status display (a notification, a tray entry, a log line).
///
/// The controller is the only writer.
pub trait StatusSink: Send {
    fn register(&mut self, text: &str);
    fn update(&mut self, text: &str);
    fn unregister(&mut self);
}

/// Status sink that reports through `tracing`.
#[derive(Debug, Default)]
pub struct TracingStatusSink {
    registered: bool,
}

impl StatusSink for TracingStatusSink {
    fn register(&mut self, text: &str) {
        self.registered = true;
        info!(target: "foreground", status = %text, "foreground registered");
    }

    fn update(&mut self, text: &str) {
        if self.registered {
            info!(target: "foreground", status = %text, "foreground status");
        }
    }

    fn unregister(&mut self) {
        if std::mem::take(&mut self.registered) {
            info!(target: "foreground", "foreground released");
        }
    }
}

/// Status line text.
///
/// `ports` is the forward set of the running session, `None` when no VM is
/// running.
pub fn status_text(ports: Option<&PortMap>, ip: Option<IpAddr>, wake_held: bool) -> String {
    let mut text = match ports {
        Some(ports) => {
            let mut s = String::from("VM running.");
            if let Some(ip) = ip {
                s.push_str(&format!(" IP: {ip}"));
            }
            s.push_str(&format!("\nForwarded ports: {}", ports.summary()));
            s
        }
        None => NOT_INITIALIZED.to_string(),
    };
    if wake_held {
        text.push_str(" | Wake lock held");
    }
    text
}

/// Primary outbound address of this host, if it has a route anywhere.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn local_ip() -> Option<IpAddr> {
    let probe = |bind: &str, target: &str| -> Option<IpAddr> {
        let socket = UdpSocket::bind(bind).ok()?;
        socket.connect(target).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
    };
    probe("0.0.0.0:0", "8.8.8.8:80").or_else(|| probe("[::]:0", "[2001:4860:4860::8888]:80"))
}

// ---------------------------------------------------------------------------
// Wake holds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    /// Keeps the CPU running.
    Wake,
    /// Keeps the network interface at full power.
    Wifi,
}

/// Platform mechanism behind the holds.
pub trait HoldBackend: Send {
    fn acquire(&mut self, hold: Hold) -> std::io::Result<()>;
    fn release(&mut self, hold: Hold);
}

/// Backend for hosts without a power manager; only records the request.
#[derive(Debug, Default)]
pub struct LoggingHoldBackend;

impl HoldBackend for LoggingHoldBackend {
    fn acquire(&mut self, hold: Hold) -> std::io::Result<()> {
        debug!(?hold, "hold acquired");
        Ok(())
    }

    fn release(&mut self, hold: Hold) {
        debug!(?hold, "hold released");
    }
}

/// The wake and wifi holds, always taken and dropped together.
pub struct WakeHolds {
    backend: Box<dyn HoldBackend>,
    held: bool,
}

impl Default for WakeHolds {
    fn default() -> Self {
        Self::new(Box::new(LoggingHoldBackend))
    }
}

impl WakeHolds {
    pub fn new(backend: Box<dyn HoldBackend>) -> Self {
        Self {
            backend,
            held: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Take both holds. If the second cannot be taken the first is released.
    pub fn acquire(&mut self) -> std::io::Result<()> {
        if self.held {
            return Ok(());
        }
        self.backend.acquire(Hold::Wake)?;
        if let Err(e) = self.backend.acquire(Hold::Wifi) {
            warn!(error = %e, "wifi hold unavailable, dropping wake hold");
            self.backend.release(Hold::Wake);
            return Err(e);
        }
        self.held = true;
        info!("wake lock acquired");
        Ok(())
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.backend.release(Hold::Wifi);
        self.backend.release(Hold::Wake);
        self.held = false;
        info!("wake lock released");
    }
}

impl Drop for WakeHolds {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        fail_wifi: bool,
    }

    impl HoldBackend for Recorder {
        fn acquire(&mut self, hold: Hold) -> std::io::Result<()> {
            if self.fail_wifi && hold == Hold::Wifi {
                return Err(std::io::Error::other("no wifi"));
            }
            self.log.lock().unwrap().push(format!("+{hold:?}"));
            Ok(())
        }

        fn release(&mut self, hold: Hold) {
            self.log.lock().unwrap().push(format!("-{hold:?}"));
        }
    }

    #[test]
    fn holds_move_in_pairs() {
        let rec = Recorder::default();
        let log = rec.log.clone();
        let mut holds = WakeHolds::new(Box::new(rec));

        holds.acquire().unwrap();
        holds.acquire().unwrap();
        assert!(holds.is_held());
        holds.release();
        holds.release();
        assert!(!holds.is_held());

        assert_eq!(*log.lock().unwrap(), vec!["+Wake", "+Wifi", "-Wifi", "-Wake"]);
    }

    #[test]
    fn failed_wifi_hold_rolls_back_wake() {
        let rec = Recorder {
            fail_wifi: true,
            ..Recorder::default()
        };
        let log = rec.log.clone();
        let mut holds = WakeHolds::new(Box::new(rec));

        assert!(holds.acquire().is_err());
        assert!(!holds.is_held());
        assert_eq!(*log.lock().unwrap(), vec!["+Wake", "-Wake"]);
    }

    #[test]
    fn dropping_releases() {
        let rec = Recorder::default();
        let log = rec.log.clone();
        {
            let mut holds = WakeHolds::new(Box::new(rec));
            holds.acquire().unwrap();
        }
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("-Wake"));
    }

    #[test]
    fn status_text_variants() {
        let ports = PortMap::default();
        let ip: IpAddr = "192.168.1.20".parse().unwrap();

        assert_eq!(
            status_text(Some(&ports), Some(ip), false),
            "VM running. IP: 192.168.1.20\nForwarded ports: SSH: 8022, Port 5678, Port 5700, Port 6379, Port 9000"
        );
        assert_eq!(
            status_text(Some(&ports), None, true),
            "VM running.\nForwarded ports: SSH: 8022, Port 5678, Port 5700, Port 6379, Port 9000 | Wake lock held"
        );
        assert_eq!(status_text(None, Some(ip), false), NOT_INITIALIZED);
        assert_eq!(
            status_text(None, None, true),
            "Virtual machine is not initialized. | Wake lock held"
        );
    }
}
