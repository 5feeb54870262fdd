use std::{
    collections::HashSet,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener},
    sync::OnceLock,
};

use crate::error::PortError;

/// Source of truth for port checks. The OS snapshot is only a hint; the bind
/// probe decides.
pub trait PortProbe: Send + Sync {
    /// Local ports of active TCP connections plus every listening port.
    fn occupied_ports(&self) -> HashSet<u16>;

    fn ipv6_supported(&self) -> bool;

    /// Bind `addr` and release it immediately.
    fn try_bind(&self, addr: SocketAddr) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackProbe;

impl PortProbe for LoopbackProbe {
    fn occupied_ports(&self) -> HashSet<u16> {
        os_occupied_ports()
    }

    fn ipv6_supported(&self) -> bool {
        ipv6_loopback_supported()
    }

    fn try_bind(&self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        drop(listener);
        Ok(())
    }
}

pub fn ipv6_loopback_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_ok())
}

#[cfg(target_os = "linux")]
fn os_occupied_ports() -> HashSet<u16> {
    let mut out = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match std::fs::read_to_string(table) {
            Ok(text) => out.extend(parse_proc_net_tcp(&text)),
            Err(e) => tracing::debug!(table, error = %e, "tcp table unavailable"),
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn os_occupied_ports() -> HashSet<u16> {
    HashSet::new()
}

/// Local ports from a `/proc/net/tcp{,6}` table, any socket state.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_net_tcp(text: &str) -> impl Iterator<Item = u16> + '_ {
    text.lines().skip(1).filter_map(|line| {
        let local = line.split_whitespace().nth(1)?;
        let (_, port_hex) = local.rsplit_once(':')?;
        u16::from_str_radix(port_hex, 16).ok()
    })
}

/// Picks the first port from a preferred range that binds on every loopback
/// family the host offers.
#[derive(Debug, Clone, Default)]
pub struct PortNegotiator<P = LoopbackProbe> {
    probe: P,
}

impl PortNegotiator<LoopbackProbe> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P: PortProbe> PortNegotiator<P> {
    pub fn with_probe(probe: P) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Tries `preferred`, `preferred + 1`, ... for at most `max_attempts`
    /// ports and returns the first usable one. The range never wraps.
    pub fn find_port(&self, preferred: u16, max_attempts: u16) -> Result<u16, PortError> {
        let last = preferred.saturating_add(max_attempts.saturating_sub(1));
        let occupied = self.probe.occupied_ports();
        let dual_stack = self.probe.ipv6_supported();
        tracing::debug!(
            preferred,
            max_attempts,
            occupied = occupied.len(),
            dual_stack,
            "negotiating control port"
        );

        for port in (preferred..=last).take(max_attempts as usize) {
            if port == 0 {
                continue;
            }
            if occupied.contains(&port) {
                tracing::info!(port, "port reported in use by the OS, trying next");
                continue;
            }
            if self.bindable(port, dual_stack) {
                return Ok(port);
            }
            tracing::info!(port, "port failed bind probe, trying next");
        }

        tracing::error!(first = preferred, last, "no free port in range");
        Err(PortError::NoPortAvailable {
            first: preferred,
            last,
        })
    }

    fn bindable(&self, port: u16, dual_stack: bool) -> bool {
        let v4 = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        if let Err(e) = self.probe.try_bind(v4) {
            tracing::debug!(%v4, error = %e, "bind probe failed");
            return false;
        }
        if !dual_stack {
            return true;
        }
        let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, port));
        if let Err(e) = self.probe.try_bind(v6) {
            tracing::debug!(%v6, error = %e, "bind probe failed");
            return false;
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    /// Scripted probe: ports in `busy_v4`/`busy_v6` refuse to bind. Every
    /// probe sleeps for `bind_delay` first.
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub occupied: HashSet<u16>,
        pub busy_v4: HashSet<u16>,
        pub busy_v6: HashSet<u16>,
        pub ipv6: bool,
        pub bind_delay: Duration,
        pub v4_probes: AtomicUsize,
        pub probed: Mutex<Vec<SocketAddr>>,
    }

    impl PortProbe for FakeProbe {
        fn occupied_ports(&self) -> HashSet<u16> {
            self.occupied.clone()
        }

        fn ipv6_supported(&self) -> bool {
            self.ipv6
        }

        fn try_bind(&self, addr: SocketAddr) -> io::Result<()> {
            std::thread::sleep(self.bind_delay);
            self.probed.lock().unwrap().push(addr);
            let busy = if addr.is_ipv4() {
                self.v4_probes.fetch_add(1, Ordering::SeqCst);
                &self.busy_v4
            } else {
                &self.busy_v6
            };
            if busy.contains(&addr.port()) {
                Err(io::Error::from(io::ErrorKind::AddrInUse))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn skips_snapshot_ports_without_probing() {
        let probe = FakeProbe {
            occupied: HashSet::from([6500]),
            ..Default::default()
        };
        let neg = PortNegotiator::with_probe(probe);
        assert_eq!(neg.find_port(6500, 10).unwrap(), 6501);
        assert_eq!(neg.probe().v4_probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn requires_both_families() {
        let probe = FakeProbe {
            busy_v6: HashSet::from([6500, 6501]),
            ipv6: true,
            ..Default::default()
        };
        let neg = PortNegotiator::with_probe(probe);
        assert_eq!(neg.find_port(6500, 10).unwrap(), 6502);
    }

    #[test]
    fn ignores_ipv6_when_unsupported() {
        let probe = FakeProbe {
            busy_v6: HashSet::from([6500]),
            ipv6: false,
            ..Default::default()
        };
        let neg = PortNegotiator::with_probe(probe);
        assert_eq!(neg.find_port(6500, 10).unwrap(), 6500);
        let probed = neg.probe().probed.lock().unwrap().clone();
        assert!(probed.iter().all(|a| a.is_ipv4()));
    }

    #[test]
    fn exhausted_range_is_bounded() {
        let probe = FakeProbe {
            occupied: HashSet::from([7000, 7003]),
            busy_v4: (7000..7100).collect(),
            ipv6: true,
            ..Default::default()
        };
        let neg = PortNegotiator::with_probe(probe);
        let err = neg.find_port(7000, 5).unwrap_err();
        assert!(matches!(
            err,
            PortError::NoPortAvailable {
                first: 7000,
                last: 7004
            }
        ));
        assert!(neg.probe().v4_probes.load(Ordering::SeqCst) <= 5);
        let probed = neg.probe().probed.lock().unwrap().clone();
        assert!(probed.iter().all(|a| (7000..=7004).contains(&a.port())));
    }

    #[test]
    fn range_does_not_wrap_past_max_port() {
        let probe = FakeProbe {
            busy_v4: HashSet::from([65534, 65535]),
            ..Default::default()
        };
        let neg = PortNegotiator::with_probe(probe);
        let err = neg.find_port(65534, 10).unwrap_err();
        assert!(matches!(err, PortError::NoPortAvailable { last: 65535, .. }));
        assert_eq!(neg.probe().v4_probes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_attempts_finds_nothing() {
        let neg = PortNegotiator::with_probe(FakeProbe::default());
        assert!(neg.find_port(6500, 0).is_err());
        assert_eq!(neg.probe().v4_probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parses_local_ports_from_tcp_table() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 0100007F:1964 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1\n   1: 0100007F:9C40 0100007F:1964 01 00000000:00000000 00:00000000 00000000  1000        0 12346 1\n";
        let ports: HashSet<u16> = parse_proc_net_tcp(table).collect();
        assert_eq!(ports, HashSet::from([0x1964, 0x9C40]));
    }

    #[test]
    fn real_probe_skips_held_port() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();

        let found = PortNegotiator::new().find_port(port, 10).unwrap();
        assert_ne!(found, port);
        assert!(found > port && found < port + 10);
    }
}
