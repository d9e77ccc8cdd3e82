//! Remote service calls between containers.
//!
//! A container whose services are consumed elsewhere runs an [`RpcServer`].
//! Consumers get a [`RemoteStub`] per remote service: it exposes the
//! operation names carried in the service announcement and forwards each call
//! through a shared [`RemoteConnector`], which opens one TCP connection per
//! address on first use and multiplexes concurrent calls over it by request
//! id.
//!
//! ```text
//! plugin ──call──► RemoteStub ──RpcRequest──► RpcServer ──► Service::call
//!        ◄─value──            ◄─RpcResponse──
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cairn_core::{BoxError, PluginError, Service, ServiceInterface};

use crate::error::{TransportError, TransportResult};
use crate::frame::{RpcRequest, RpcResponse, ServiceAnnouncement};
use crate::link::{decode, encode, line_codec};

// =============================================================================
// Server
// =============================================================================

/// Resolves service names for an [`RpcServer`].
pub trait ServiceProvider: Send + Sync {
    /// Returns the locally registered service called `name`.
    fn lookup(&self, name: &str) -> Option<Service>;
}

impl<F> ServiceProvider for F
where
    F: Fn(&str) -> Option<Service> + Send + Sync,
{
    fn lookup(&self, name: &str) -> Option<Service> {
        self(name)
    }
}

/// Serves local services to other containers. Stops when dropped.
pub struct RpcServer {
    local_addr: SocketAddr,
    token: CancellationToken,
}

impl RpcServer {
    /// Binds `addr` and starts accepting connections.
    pub async fn bind(addr: &str, provider: Arc<dyn ServiceProvider>) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                addr: addr.to_string(),
                reason: format!("bind failed: {e}"),
            })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "RPC server listening");

        let token = CancellationToken::new();
        tokio::spawn(accept_loop(listener, provider, token.clone()));
        Ok(Self { local_addr, token })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound address as announced to other containers.
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Stops accepting and closes open connections.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    provider: Arc<dyn ServiceProvider>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "RPC connection accepted");
                    tokio::spawn(serve_connection(stream, provider.clone(), token.child_token()));
                }
                Err(e) => warn!(error = %e, "RPC accept failed"),
            }
        }
    }
    debug!("RPC server stopped");
}

async fn serve_connection(
    stream: TcpStream,
    provider: Arc<dyn ServiceProvider>,
    token: CancellationToken,
) {
    let (read, write) = stream.into_split();
    let mut lines = FramedRead::new(read, line_codec());
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();

    tokio::spawn(async move {
        let mut sink = FramedWrite::new(write, line_codec());
        while let Some(response) = rx.recv().await {
            let line = match encode(&response) {
                Ok(line) => line,
                Err(e) => {
                    warn!(id = response.id, error = %e, "Dropping unencodable response");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                warn!(error = %e, "RPC response write failed");
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = lines.next() => next,
        };
        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "RPC read failed");
                break;
            }
            None => break,
        };
        let request: RpcRequest = match decode(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed RPC request");
                continue;
            }
        };

        let provider = provider.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(dispatch(provider, request).await);
        });
    }
}

async fn dispatch(provider: Arc<dyn ServiceProvider>, request: RpcRequest) -> RpcResponse {
    trace!(
        id = request.id,
        service = %request.service,
        operation = %request.operation,
        "RPC request"
    );
    let result = match provider.lookup(&request.service) {
        Some(service) => service
            .call(&request.operation, request.args)
            .await
            .map_err(|e| e.to_string()),
        None => Err(PluginError::not_found(&request.service).to_string()),
    };
    RpcResponse {
        id: request.id,
        result,
    }
}

// =============================================================================
// Client
// =============================================================================

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

struct Connection {
    addr: String,
    tx: mpsc::UnboundedSender<String>,
    waiters: Waiters,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    async fn open(addr: &str) -> TransportResult<Arc<Self>> {
        let stream =
            TcpStream::connect(addr)
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(addr, "RPC connection opened");

        let (read, write) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let waiters = Waiters::default();
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write, line_codec());
            loop {
                let line = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    line = rx.recv() => line,
                };
                let Some(line) = line else { break };
                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "RPC request write failed");
                    writer_closed.cancel();
                    break;
                }
            }
        });

        let reader_waiters = waiters.clone();
        let reader_closed = closed.clone();
        let peer = addr.to_string();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(read, line_codec());
            loop {
                let next = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    next = lines.next() => next,
                };
                match next {
                    Some(Ok(line)) => match decode::<RpcResponse>(&line) {
                        Ok(response) => {
                            if let Some(waiter) = reader_waiters.lock().remove(&response.id) {
                                let _ = waiter.send(response.result);
                            }
                        }
                        Err(e) => warn!(addr = %peer, error = %e, "Malformed RPC response"),
                    },
                    Some(Err(e)) => {
                        warn!(addr = %peer, error = %e, "RPC read failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_closed.cancel();
            // Dropping the senders fails every outstanding call.
            reader_waiters.lock().clear();
            debug!(addr = %peer, "RPC connection closed");
        });

        Ok(Arc::new(Self {
            addr: addr.to_string(),
            tx,
            waiters,
            next_id: AtomicU64::new(1),
            closed,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn call(&self, service: &str, operation: &str, args: Vec<Value>) -> TransportResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode(&RpcRequest {
            id,
            service: service.to_string(),
            operation: operation.to_string(),
            args,
        })?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        // Checked after registering so a concurrent close cannot strand the waiter.
        if self.is_closed() || self.tx.send(line).is_err() {
            self.waiters.lock().remove(&id);
            return Err(TransportError::ConnectionClosed {
                reason: format!("connection to {} is closed", self.addr),
            });
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(TransportError::Remote(reason)),
            Err(_) => Err(TransportError::ConnectionClosed {
                reason: format!("{} closed before responding", self.addr),
            }),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Lazily opened, reused connections to other containers' RPC servers.
#[derive(Default)]
pub struct RemoteConnector {
    connections: Mutex<HashMap<String, Arc<OnceCell<Arc<Connection>>>>>,
}

impl RemoteConnector {
    /// Creates a connector with no open connections.
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self, addr: &str) -> TransportResult<Arc<Connection>> {
        let cell = {
            let mut connections = self.connections.lock();
            let cell = connections.entry(addr.to_string()).or_default();
            if cell.get().is_some_and(|c| c.is_closed()) {
                debug!(addr, "Replacing closed RPC connection");
                *cell = Arc::default();
            }
            Arc::clone(cell)
        };
        cell.get_or_try_init(|| Connection::open(addr))
            .await
            .cloned()
    }

    /// Calls `service.operation` on the container listening at `addr`.
    pub async fn call(
        &self,
        addr: &str,
        service: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> TransportResult<Value> {
        self.connection(addr)
            .await?
            .call(service, operation, args)
            .await
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|cell| cell.get().is_some_and(|c| !c.is_closed()))
            .count()
    }
}

// =============================================================================
// RemoteStub
// =============================================================================

/// Local proxy for a service registered in another container.
pub struct RemoteStub {
    service: String,
    container: String,
    address: String,
    operations: Vec<String>,
    connector: Arc<RemoteConnector>,
}

impl RemoteStub {
    /// Builds a stub from an announcement. Returns `None` when the owning
    /// container does not listen.
    pub fn new(announcement: &ServiceAnnouncement, connector: Arc<RemoteConnector>) -> Option<Self> {
        Some(Self {
            service: announcement.service.clone(),
            container: announcement.container.clone(),
            address: announcement.address.clone()?,
            operations: announcement.operations.clone(),
            connector,
        })
    }

    /// Wraps the stub as a registry-compatible service.
    pub fn into_service(self) -> Service {
        Service::remote(Arc::new(self))
    }

    /// Container owning the real service.
    pub fn container(&self) -> &str {
        &self.container
    }
}

#[async_trait]
impl ServiceInterface for RemoteStub {
    fn operations(&self) -> Vec<String> {
        self.operations.clone()
    }

    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, BoxError> {
        if !self.operations.iter().any(|op| op == operation) {
            return Err(PluginError::remote(&self.service, operation, "unknown operation").into());
        }
        self.connector
            .call(&self.address, &self.service, operation, args)
            .await
            .map_err(|e| {
                warn!(
                    service = %self.service,
                    container = %self.container,
                    operation,
                    error = %e,
                    "Remote call failed"
                );
                PluginError::remote(&self.service, operation, e.to_string()).into()
            })
    }
}

impl std::fmt::Debug for RemoteStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStub")
            .field("service", &self.service)
            .field("container", &self.container)
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Calculator;

    #[async_trait]
    impl ServiceInterface for Calculator {
        fn operations(&self) -> Vec<String> {
            vec!["add".into(), "fail".into()]
        }

        async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, BoxError> {
            match operation {
                "add" => Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>())),
                _ => Err("division by zero".into()),
            }
        }
    }

    async fn server() -> RpcServer {
        let calculator = Service::with_interface(Calculator);
        let provider = move |name: &str| (name == "calculator").then(|| calculator.clone());
        RpcServer::bind("127.0.0.1:0", Arc::new(provider))
            .await
            .unwrap()
    }

    fn stub(address: String, connector: Arc<RemoteConnector>) -> Service {
        let announcement = ServiceAnnouncement {
            service: "calculator".into(),
            container: "math".into(),
            address: Some(address),
            operations: vec!["add".into(), "fail".into()],
        };
        RemoteStub::new(&announcement, connector)
            .unwrap()
            .into_service()
    }

    #[tokio::test]
    async fn test_remote_call_returns_value() {
        let server = server().await;
        let connector = Arc::new(RemoteConnector::new());
        let calc = stub(server.address(), connector.clone());

        assert!(calc.is_remote());
        assert_eq!(calc.operations(), ["add", "fail"]);
        let sum = calc.call("add", vec![json!(2), json!(40)]).await.unwrap();
        assert_eq!(sum, json!(42));
        assert_eq!(connector.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_connection() {
        let server = server().await;
        let connector = Arc::new(RemoteConnector::new());
        let calc = stub(server.address(), connector.clone());

        let calls = (0..16).map(|i| {
            let calc = calc.clone();
            async move { calc.call("add", vec![json!(i), json!(1)]).await }
        });
        let results = futures::future::join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i as i64 + 1));
        }
        assert_eq!(connector.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_surfaces_as_dispatch_error() {
        let server = server().await;
        let calc = stub(server.address(), Arc::new(RemoteConnector::new()));

        let err = calc.call("fail", vec![]).await.unwrap_err();
        let err = err.downcast::<PluginError>().unwrap();
        assert!(matches!(*err, PluginError::RemoteDispatch { ref reason, .. } if reason.contains("division by zero")));
    }

    #[tokio::test]
    async fn test_unknown_operation_fails_locally() {
        let connector = Arc::new(RemoteConnector::new());
        let calc = stub("127.0.0.1:9".into(), connector.clone());

        let err = calc.call("multiply", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("unknown operation"));
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_container() {
        let address = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let connector = Arc::new(RemoteConnector::new());
        let calc = stub(address, connector);
        let err = calc.call("add", vec![]).await.unwrap_err();
        assert!(err.downcast_ref::<PluginError>().is_some());
    }

    #[test]
    fn test_stub_requires_address() {
        let announcement = ServiceAnnouncement {
            service: "db".into(),
            container: "storage".into(),
            address: None,
            operations: vec![],
        };
        assert!(RemoteStub::new(&announcement, Arc::new(RemoteConnector::new())).is_none());
    }
}
