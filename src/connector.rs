//! Client-side connection establishment.
//!
//! Direct connect first; if that fails, rebind to the local address that best
//! matches the server's subnet; if that fails too, try to add a route to the
//! server's /16 and run the whole sequence once more. The retry is a bounded
//! loop, never recursion.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::Arc;

use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{ConnectError, RouteError};
use crate::netinfo::{
    find_matching_local, subnet_of, IpRouteMutator, LocalAddress, NetworkInfo, RouteAttempt,
    RouteMutator, SystemNetwork, SUBNET_PREFIX_LEN,
};

/// How many times the sequence restarts after a successful route insertion
pub const MAX_ROUTE_RETRIES: usize = 1;

pub const REMEDIATION_HINTS: [&str; 4] = [
    "Make sure server and client are on the same network or can route to each other",
    "Check if the server is running and bound to the correct IP",
    "Check if any firewall is blocking the connection",
    "Try running the client with sudo to enable automatic route configuration",
];

/// Opens TCP connections, optionally from a fixed local address
pub trait Dialer: Send + Sync {
    fn connect(&self, target: SocketAddrV4, local: Option<Ipv4Addr>) -> io::Result<TcpStream>;
}

/// Real sockets; no timeout beyond the OS default
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketDialer;

impl Dialer for SocketDialer {
    fn connect(&self, target: SocketAddrV4, local: Option<Ipv4Addr>) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        if let Some(ip) = local {
            // Port 0 lets the OS choose
            socket.bind(&SocketAddrV4::new(ip, 0).into())?;
        }
        socket.connect(&target.into())?;
        let stream: TcpStream = socket.into();
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

pub struct Connector {
    port: u16,
    dialer: Arc<dyn Dialer>,
    network: Arc<dyn NetworkInfo>,
    routes: Arc<dyn RouteMutator>,
}

impl Connector {
    /// Connector backed by real sockets, interfaces and `ip route`
    pub fn new(port: u16) -> Self {
        Self {
            port,
            dialer: Arc::new(SocketDialer),
            network: Arc::new(SystemNetwork::default()),
            routes: Arc::new(IpRouteMutator),
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkInfo>) -> Self {
        self.network = network;
        self
    }

    pub fn with_route_mutator(mut self, routes: Arc<dyn RouteMutator>) -> Self {
        self.routes = routes;
        self
    }

    /// Parse a dotted IPv4 server address and connect to it
    pub fn connect(&self, server: &str) -> Result<TcpStream, ConnectError> {
        let ip: Ipv4Addr = server
            .trim()
            .parse()
            .map_err(|_| ConnectError::InvalidAddress(server.to_string()))?;
        self.connect_ip(ip)
    }

    pub fn connect_ip(&self, server: Ipv4Addr) -> Result<TcpStream, ConnectError> {
        let target = SocketAddrV4::new(server, self.port);
        info!("Connecting to server at {}...", target);

        let mut last_err: Option<io::Error> = None;
        for attempt in 0..=MAX_ROUTE_RETRIES {
            match self.dialer.connect(target, None) {
                Ok(stream) => {
                    info!("Connected directly to server");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("direct connect to {} failed: {}", target, e);
                    last_err = Some(e);
                }
            }

            let local = self.find_local_match(server);
            if let Some(ref local) = local {
                info!(
                    "Direct connection failed. Trying with local IP {} ({})...",
                    local.ip, local.interface
                );
                match self.dialer.connect(target, Some(local.ip)) {
                    Ok(stream) => {
                        info!("Connected to server using local IP {}", local.ip);
                        return Ok(stream);
                    }
                    Err(e) => {
                        debug!("connect from {} failed: {}", local.ip, e);
                        last_err = Some(e);
                    }
                }
            }

            // The retry pass never repairs again; the route is already in place
            if attempt == MAX_ROUTE_RETRIES {
                break;
            }
            match local {
                Some(local) if self.repair_route(server, local.ip) => {
                    info!("Retrying connection after route change");
                }
                _ => break,
            }
        }

        let source = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection attempted"));
        report_failure(target, &source);
        Err(ConnectError::Unreachable { target, source })
    }

    fn find_local_match(&self, server: Ipv4Addr) -> Option<LocalAddress> {
        match self.network.local_ipv4_addresses() {
            Ok(locals) => find_matching_local(&locals, server),
            Err(e) => {
                warn!("Error getting network interfaces: {}", e);
                None
            }
        }
    }

    /// Returns true when a route was added and the sequence should restart
    fn repair_route(&self, server: Ipv4Addr, local: Ipv4Addr) -> bool {
        let server_net = subnet_of(server);
        let local_net = subnet_of(local);
        if server_net == local_net {
            debug!("server shares subnet {} with {}; no route to add", server_net, local);
            return false;
        }
        info!(
            "Server is on a different subnet ({} vs {})",
            server_net, local_net
        );

        let route = match self.network.default_gateway() {
            Some(gateway) => {
                info!(
                    "Attempting to add route to server network via default gateway {}",
                    gateway
                );
                RouteAttempt {
                    network: server_net,
                    prefix_len: SUBNET_PREFIX_LEN,
                    gateway,
                }
            }
            None => {
                info!("Attempting to add direct route to server network");
                RouteAttempt {
                    network: server_net,
                    prefix_len: SUBNET_PREFIX_LEN,
                    gateway: server,
                }
            }
        };

        match self.routes.add_route(&route) {
            Ok(()) => true,
            Err(RouteError::NeedsPrivilege { manual }) => {
                warn!("Adding routes requires root privileges.");
                warn!("To add route manually: {}", manual);
                false
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}

fn report_failure(target: SocketAddrV4, err: &io::Error) {
    error!("Connection failed: {}", err);
    error!("Could not connect to server at {}", target);
    error!("Possible solutions:");
    for (i, hint) in REMEDIATION_HINTS.iter().enumerate() {
        error!("{}. {}", i + 1, hint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_PORT;
    use std::collections::VecDeque;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted dialer: each call pops the next outcome; exhausted means refused
    struct ScriptedDialer {
        listener: TcpListener,
        outcomes: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<Option<Ipv4Addr>>>,
    }

    impl ScriptedDialer {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Option<Ipv4Addr>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Dialer for ScriptedDialer {
        fn connect(&self, _target: SocketAddrV4, local: Option<Ipv4Addr>) -> io::Result<TcpStream> {
            self.calls.lock().unwrap().push(local);
            let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(false);
            if ok {
                TcpStream::connect(self.listener.local_addr()?)
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"))
            }
        }
    }

    struct FakeNetwork {
        locals: Vec<LocalAddress>,
        gateway: Option<Ipv4Addr>,
        lookups: AtomicUsize,
    }

    impl FakeNetwork {
        fn new(locals: &[(&str, &str)], gateway: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                locals: locals
                    .iter()
                    .map(|(name, addr)| LocalAddress::new(*name, ip(addr)))
                    .collect(),
                gateway: gateway.map(ip),
                lookups: AtomicUsize::new(0),
            })
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    impl NetworkInfo for FakeNetwork {
        fn local_ipv4_addresses(&self) -> io::Result<Vec<LocalAddress>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.locals.clone())
        }

        fn default_gateway(&self) -> Option<Ipv4Addr> {
            self.gateway
        }
    }

    struct RecordingRoutes {
        privileged: bool,
        attempts: Mutex<Vec<RouteAttempt>>,
    }

    impl RecordingRoutes {
        fn new(privileged: bool) -> Arc<Self> {
            Arc::new(Self {
                privileged,
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<RouteAttempt> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl RouteMutator for RecordingRoutes {
        fn add_route(&self, route: &RouteAttempt) -> Result<(), RouteError> {
            self.attempts.lock().unwrap().push(*route);
            if self.privileged {
                Ok(())
            } else {
                Err(RouteError::NeedsPrivilege {
                    manual: route.manual_command(),
                })
            }
        }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn connector(
        dialer: &Arc<ScriptedDialer>,
        network: &Arc<FakeNetwork>,
        routes: &Arc<RecordingRoutes>,
    ) -> Connector {
        Connector::new(DEFAULT_PORT)
            .with_dialer(dialer.clone())
            .with_network(network.clone())
            .with_route_mutator(routes.clone())
    }

    #[test]
    fn test_direct_connect_skips_fallbacks() {
        let dialer = ScriptedDialer::new(&[true]);
        let network = FakeNetwork::new(&[("eth0", "10.0.0.5")], Some("10.0.0.1"));
        let routes = RecordingRoutes::new(true);

        connector(&dialer, &network, &routes)
            .connect("192.168.7.7")
            .unwrap();

        assert_eq!(dialer.calls(), vec![None]);
        assert_eq!(network.lookups(), 0);
        assert!(routes.attempts().is_empty());
    }

    #[test]
    fn test_rebind_to_matching_local_address() {
        let dialer = ScriptedDialer::new(&[false, true]);
        let network = FakeNetwork::new(
            &[("eth0", "10.0.0.5"), ("eth1", "192.168.1.5")],
            Some("10.0.0.1"),
        );
        let routes = RecordingRoutes::new(true);

        connector(&dialer, &network, &routes)
            .connect("192.168.7.7")
            .unwrap();

        assert_eq!(dialer.calls(), vec![None, Some(ip("192.168.1.5"))]);
        assert_eq!(network.lookups(), 1);
        assert!(routes.attempts().is_empty());
    }

    #[test]
    fn test_unprivileged_route_repair_fails_once() {
        let dialer = ScriptedDialer::new(&[]);
        let network = FakeNetwork::new(&[("eth0", "10.0.0.5")], Some("10.0.0.1"));
        let routes = RecordingRoutes::new(false);

        let err = connector(&dialer, &network, &routes)
            .connect("192.168.7.7")
            .unwrap_err();

        match err {
            ConnectError::Unreachable { target, .. } => assert_eq!(*target.ip(), ip("192.168.7.7")),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            routes.attempts(),
            vec![RouteAttempt {
                network: ip("192.168.0.0"),
                prefix_len: 16,
                gateway: ip("10.0.0.1"),
            }]
        );
        assert_eq!(dialer.calls(), vec![None, Some(ip("10.0.0.5"))]);
    }

    #[test]
    fn test_route_repair_retries_exactly_once() {
        let dialer = ScriptedDialer::new(&[false, false, true]);
        let network = FakeNetwork::new(&[("eth0", "10.0.0.5")], Some("10.0.0.1"));
        let routes = RecordingRoutes::new(true);

        connector(&dialer, &network, &routes)
            .connect("192.168.7.7")
            .unwrap();

        assert_eq!(routes.attempts().len(), 1);
        assert_eq!(dialer.calls(), vec![None, Some(ip("10.0.0.5")), None]);
    }

    #[test]
    fn test_retry_pass_never_repairs_again() {
        let dialer = ScriptedDialer::new(&[]);
        let network = FakeNetwork::new(&[("eth0", "10.0.0.5")], Some("10.0.0.1"));
        let routes = RecordingRoutes::new(true);

        let err = connector(&dialer, &network, &routes)
            .connect("192.168.7.7")
            .unwrap_err();

        assert!(matches!(err, ConnectError::Unreachable { .. }));
        assert_eq!(routes.attempts().len(), 1);
        assert_eq!(network.lookups(), 2);
        assert_eq!(
            dialer.calls(),
            vec![None, Some(ip("10.0.0.5")), None, Some(ip("10.0.0.5"))]
        );
    }

    #[test]
    fn test_route_via_server_without_gateway() {
        let dialer = ScriptedDialer::new(&[]);
        let network = FakeNetwork::new(&[("eth0", "10.0.0.5")], None);
        let routes = RecordingRoutes::new(false);

        let _ = connector(&dialer, &network, &routes).connect("192.168.7.7");

        let attempts = routes.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].gateway, ip("192.168.7.7"));
    }

    #[test]
    fn test_same_subnet_skips_route_repair() {
        let dialer = ScriptedDialer::new(&[]);
        let network = FakeNetwork::new(&[("eth0", "192.168.1.5")], Some("192.168.1.1"));
        let routes = RecordingRoutes::new(true);

        assert!(connector(&dialer, &network, &routes)
            .connect("192.168.7.7")
            .is_err());
        assert!(routes.attempts().is_empty());
        assert_eq!(dialer.calls().len(), 2);
    }

    #[test]
    fn test_no_local_addresses() {
        let dialer = ScriptedDialer::new(&[]);
        let network = FakeNetwork::new(&[], Some("10.0.0.1"));
        let routes = RecordingRoutes::new(true);

        assert!(connector(&dialer, &network, &routes)
            .connect("192.168.7.7")
            .is_err());
        assert_eq!(dialer.calls(), vec![None]);
        assert!(routes.attempts().is_empty());
    }

    #[test]
    fn test_invalid_address() {
        let dialer = ScriptedDialer::new(&[true]);
        let network = FakeNetwork::new(&[], None);
        let routes = RecordingRoutes::new(true);

        let err = connector(&dialer, &network, &routes)
            .connect("not.an.address")
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidAddress(_)));
        assert!(dialer.calls().is_empty());
    }

    #[test]
    fn test_socket_dialer_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = Connector::new(port).connect("127.0.0.1").unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);

        let bound = SocketDialer
            .connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), Some(Ipv4Addr::LOCALHOST))
            .unwrap();
        assert_eq!(bound.local_addr().unwrap().ip(), Ipv4Addr::LOCALHOST);
    }
}
