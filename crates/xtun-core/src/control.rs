//! Control Channel
//!
//! Request/response protocol between the host application and the core.
//!
//! # Framing
//!
//! Each message on the socket is a 4-byte big-endian length followed by a
//! JSON body. A connection may carry any number of request/response pairs;
//! every request gets exactly one reply.
//!
//! ```json
//! { "type": "updateConfig", "data": { "id": "...", "protocol": "vless", ... } }
//! { "payload": { "success": true, "error": null } }
//! { "error": { "code": "malformed", "message": "..." } }
//! ```

use crate::descriptor::ServerDescriptor;
use crate::lifecycle::{LifecycleState, TunnelError, TunnelService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a frame body (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default time a request may take
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Control channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("IPC I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::Io(e.to_string())
    }
}

/// Request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    GetStatus,
    GetStatistics,
    UpdateConfig,
}

/// A control request.
///
/// `data` carries the descriptor for `updateConfig`, either as a JSON object,
/// as a string holding JSON, or as an array of bytes holding JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlRequest {
    pub fn get_status() -> Self {
        Self {
            kind: RequestKind::GetStatus,
            data: None,
        }
    }

    pub fn get_statistics() -> Self {
        Self {
            kind: RequestKind::GetStatistics,
            data: None,
        }
    }

    pub fn update_config(descriptor: &ServerDescriptor) -> Result<Self, IpcError> {
        let data = serde_json::to_value(descriptor)
            .map_err(|e| IpcError::Malformed(format!("descriptor: {}", e)))?;
        Ok(Self {
            kind: RequestKind::UpdateConfig,
            data: Some(data),
        })
    }

    /// The descriptor carried in `data`.
    pub fn descriptor(&self) -> Result<ServerDescriptor, IpcError> {
        let malformed = |e: serde_json::Error| IpcError::Malformed(format!("descriptor: {}", e));

        match &self.data {
            None | Some(Value::Null) => Err(IpcError::Malformed(
                "updateConfig requires a descriptor".to_string(),
            )),
            Some(Value::String(text)) => serde_json::from_str(text).map_err(malformed),
            Some(Value::Array(items)) => {
                let bytes = items
                    .iter()
                    .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| IpcError::Malformed("data is not a byte array".to_string()))?;
                serde_json::from_slice(&bytes).map_err(malformed)
            }
            Some(value) => serde_json::from_value(value.clone()).map_err(malformed),
        }
    }
}

/// `getStatus` answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub is_connected: bool,
    pub state: LifecycleState,
    pub server_name: String,
    /// Seconds, `null` when not connected
    pub connected_time: Option<f64>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// `getStatistics` answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsPayload {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    /// Seconds
    pub connected_time: f64,
    /// Milliseconds, -1 when unknown
    pub server_latency: i64,
    pub upload_rate: f64,
    pub download_rate: f64,
}

/// `updateConfig` answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfigPayload {
    pub success: bool,
    pub error: Option<String>,
}

impl From<Result<(), TunnelError>> for UpdateConfigPayload {
    fn from(result: Result<(), TunnelError>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                error: None,
            },
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Any successful answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Status(StatusPayload),
    Statistics(StatisticsPayload),
    UpdateConfig(UpdateConfigPayload),
}

/// Error code carried in an error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCode {
    Malformed,
    Timeout,
    Internal,
}

/// What goes back on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlReply {
    Payload(ResponsePayload),
    Error { code: ErrorCode, message: String },
}

impl From<Result<ResponsePayload, IpcError>> for ControlReply {
    fn from(result: Result<ResponsePayload, IpcError>) -> Self {
        match result {
            Ok(payload) => ControlReply::Payload(payload),
            Err(e) => {
                let code = match &e {
                    IpcError::Malformed(_) => ErrorCode::Malformed,
                    IpcError::Timeout => ErrorCode::Timeout,
                    IpcError::Io(_) => ErrorCode::Internal,
                };
                ControlReply::Error {
                    code,
                    message: e.to_string(),
                }
            }
        }
    }
}

impl ControlReply {
    /// Back to a `Result` on the client side.
    pub fn into_result(self) -> Result<ResponsePayload, IpcError> {
        match self {
            ControlReply::Payload(payload) => Ok(payload),
            ControlReply::Error { code, message } => Err(match code {
                ErrorCode::Malformed => IpcError::Malformed(message),
                ErrorCode::Timeout => IpcError::Timeout,
                ErrorCode::Internal => IpcError::Io(message),
            }),
        }
    }
}

/// Answers control requests against a [`TunnelService`].
#[derive(Clone)]
pub struct ControlChannel {
    service: TunnelService,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(service: TunnelService, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    fn status(&self) -> StatusPayload {
        let status = self.service.status();
        StatusPayload {
            is_connected: status.state.is_connected(),
            state: status.state,
            server_name: status.server_name.unwrap_or_default(),
            connected_time: status.connected_time.map(|d| d.as_secs_f64()),
            bytes_received: status.bytes_received,
            bytes_sent: status.bytes_sent,
        }
    }

    fn statistics(&self) -> StatisticsPayload {
        let snapshot = self.service.snapshot();
        StatisticsPayload {
            bytes_received: snapshot.bytes_received,
            bytes_sent: snapshot.bytes_sent,
            packets_received: snapshot.packets_received,
            packets_sent: snapshot.packets_sent,
            connected_time: self
                .service
                .connected_time()
                .map_or(0.0, |d| d.as_secs_f64()),
            server_latency: snapshot
                .server_latency
                .and_then(|ms| i64::try_from(ms).ok())
                .unwrap_or(-1),
            upload_rate: snapshot.upload_rate,
            download_rate: snapshot.download_rate,
        }
    }

    /// Handle one request.
    ///
    /// A reconfigure that outlives the timeout keeps running; only the
    /// caller stops waiting for it.
    pub async fn handle(&self, request: ControlRequest) -> Result<ResponsePayload, IpcError> {
        match request.kind {
            RequestKind::GetStatus => Ok(ResponsePayload::Status(self.status())),
            RequestKind::GetStatistics => Ok(ResponsePayload::Statistics(self.statistics())),
            RequestKind::UpdateConfig => {
                let descriptor = request.descriptor()?;
                info!("Control: updateConfig to {}", descriptor.display_name());

                let service = self.service.clone();
                let task = tokio::spawn(async move { service.update_config(descriptor).await });
                match tokio::time::timeout(self.timeout, task).await {
                    Ok(Ok(result)) => Ok(ResponsePayload::UpdateConfig(result.into())),
                    Ok(Err(e)) => Err(IpcError::Io(format!("update task failed: {}", e))),
                    Err(_) => {
                        warn!("Control: updateConfig still running after {:?}", self.timeout);
                        Err(IpcError::Timeout)
                    }
                }
            }
        }
    }

    /// Decode a frame body and produce its reply.
    pub async fn handle_message(&self, body: &[u8]) -> ControlReply {
        let request = match serde_json::from_slice::<ControlRequest>(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Control: malformed request: {}", e);
                return Err(IpcError::Malformed(e.to_string())).into();
            }
        };
        debug!("Control: {:?}", request.kind);
        self.handle(request).await.into()
    }
}

/// Serialize `msg` into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    let body = serde_json::to_vec(msg).map_err(|e| IpcError::Malformed(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| IpcError::Malformed(format!("message of {} bytes", body.len())))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame body; `None` when the peer closed between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
) -> Result<Option<Vec<u8>>, IpcError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_message_size {
        return Err(IpcError::Malformed(format!(
            "message too large: {} bytes (max {})",
            len, max_message_size
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, msg: &T) -> Result<(), IpcError> {
    writer.write_all(&encode_frame(msg)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Serves a [`ControlChannel`] on a Unix socket.
pub struct ControlServer {
    channel: Arc<ControlChannel>,
    socket_path: PathBuf,
    max_message_size: usize,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    pub fn new(channel: ControlChannel, socket_path: impl Into<PathBuf>, max_message_size: usize) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            channel: Arc::new(channel),
            socket_path: socket_path.into(),
            max_message_size,
            shutdown_tx,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), IpcError> {
        remove_socket(&self.socket_path).await?;
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660)).await?;
        }
        info!("Control socket listening on {}", self.socket_path.display());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let channel = Arc::clone(&self.channel);
                        let max = self.max_message_size;
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, channel, max).await {
                                debug!("Control connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Control accept failed: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("Control socket shutting down");
                    break;
                }
            }
        }

        if let Err(e) = remove_socket(&self.socket_path).await {
            warn!("Could not remove control socket {}: {}", self.socket_path.display(), e);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Remove a socket file left at `path`; nothing there is fine.
async fn remove_socket(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    channel: Arc<ControlChannel>,
    max_message_size: usize,
) -> Result<(), IpcError> {
    loop {
        let body = match read_frame(&mut stream, max_message_size).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(()),
            Err(e @ IpcError::Malformed(_)) => {
                // The rest of the oversize body is still on the wire: answer and hang up
                warn!("Control: {}", e);
                let reply = ControlReply::from(Err(e.clone()));
                write_frame(&mut stream, &reply).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let reply = channel.handle_message(&body).await;
        write_frame(&mut stream, &reply).await?;
    }
}

/// Client side of the control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
    max_message_size: usize,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Send one request and wait for its reply.
    pub async fn request(&self, request: &ControlRequest) -> Result<ResponsePayload, IpcError> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await?;
            write_frame(&mut stream, request).await?;
            let body = read_frame(&mut stream, self.max_message_size)
                .await?
                .ok_or_else(|| IpcError::Io("connection closed before reply".to_string()))?;
            serde_json::from_slice::<ControlReply>(&body)
                .map_err(|e| IpcError::Malformed(e.to_string()))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| IpcError::Timeout)??
            .into_result()
    }

    pub async fn get_status(&self) -> Result<StatusPayload, IpcError> {
        match self.request(&ControlRequest::get_status()).await? {
            ResponsePayload::Status(status) => Ok(status),
            other => Err(IpcError::Malformed(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn get_statistics(&self) -> Result<StatisticsPayload, IpcError> {
        match self.request(&ControlRequest::get_statistics()).await? {
            ResponsePayload::Statistics(stats) => Ok(stats),
            other => Err(IpcError::Malformed(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn update_config(&self, descriptor: &ServerDescriptor) -> Result<UpdateConfigPayload, IpcError> {
        match self.request(&ControlRequest::update_config(descriptor)?).await? {
            ResponsePayload::UpdateConfig(result) => Ok(result),
            other => Err(IpcError::Malformed(format!("unexpected reply {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ProtocolSettings;
    use crate::lifecycle::{ServiceOptions, ServiceParts};
    use crate::simulator::{ChannelPacketFlow, LoopbackConnector, MemoryInterface, SimulatedLauncher};
    use crate::storage::MemoryStorage;
    use crate::translator::Translator;
    use serde_json::json;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    async fn service(dir: &Path) -> TunnelService {
        let (flow, _host) = ChannelPacketFlow::new();
        TunnelService::new(ServiceParts {
            translator: Translator::default(),
            launcher: Arc::new(SimulatedLauncher::new()),
            runtime_dir: dir.to_path_buf(),
            engine_stop_timeout: Duration::from_secs(3),
            interface: Arc::new(MemoryInterface::new()),
            flow: Arc::new(flow),
            connector: Arc::new(LoopbackConnector::new()),
            storage: Arc::new(MemoryStorage::new()),
            options: ServiceOptions::default(),
        })
        .await
    }

    fn vless(name: &str) -> ServerDescriptor {
        ServerDescriptor::new(name, "v.example.com", 443, ProtocolSettings::vless(UUID))
    }

    #[test]
    fn test_request_wire_shape() {
        let request: ControlRequest = serde_json::from_value(json!({ "type": "getStatus" })).unwrap();
        assert_eq!(request, ControlRequest::get_status());

        let value = serde_json::to_value(ControlRequest::get_statistics()).unwrap();
        assert_eq!(value, json!({ "type": "getStatistics" }));
    }

    #[test]
    fn test_descriptor_from_each_data_form() {
        let descriptor = vless("Tokyo");
        let object = serde_json::to_value(&descriptor).unwrap();
        let text = object.to_string();
        let bytes: Vec<Value> = text.bytes().map(|b| json!(b)).collect();

        for data in [object, Value::String(text.clone()), Value::Array(bytes)] {
            let request = ControlRequest {
                kind: RequestKind::UpdateConfig,
                data: Some(data),
            };
            assert_eq!(request.descriptor().unwrap(), descriptor);
        }

        let empty = ControlRequest {
            kind: RequestKind::UpdateConfig,
            data: None,
        };
        assert!(matches!(empty.descriptor(), Err(IpcError::Malformed(_))));

        let not_bytes = ControlRequest {
            kind: RequestKind::UpdateConfig,
            data: Some(json!([1, 2, 300])),
        };
        assert!(matches!(not_bytes.descriptor(), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_reply_wire_shape() {
        let ok = ControlReply::Payload(ResponsePayload::UpdateConfig(UpdateConfigPayload {
            success: true,
            error: None,
        }));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "payload": { "success": true, "error": null } })
        );

        let err = ControlReply::from(Err(IpcError::Timeout));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["code"], json!("timeout"));
        let back: ControlReply = serde_json::from_value(value).unwrap();
        assert_eq!(back.into_result(), Err(IpcError::Timeout));
    }

    #[test]
    fn test_untagged_payloads_decode_to_their_variant() {
        let stats = json!({
            "bytesReceived": 1, "bytesSent": 2, "packetsReceived": 3, "packetsSent": 4,
            "connectedTime": 5.0, "serverLatency": -1, "uploadRate": 0.0, "downloadRate": 0.0
        });
        assert!(matches!(
            serde_json::from_value::<ResponsePayload>(stats).unwrap(),
            ResponsePayload::Statistics(_)
        ));

        let update = json!({ "success": false, "error": "Not connected" });
        assert!(matches!(
            serde_json::from_value::<ResponsePayload>(update).unwrap(),
            ResponsePayload::UpdateConfig(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_when_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ControlChannel::new(service(dir.path()).await, DEFAULT_REQUEST_TIMEOUT);

        let reply = channel.handle(ControlRequest::get_status()).await.unwrap();
        match reply {
            ResponsePayload::Status(status) => {
                assert!(!status.is_connected);
                assert_eq!(status.state, LifecycleState::Disconnected);
                assert_eq!(status.connected_time, None);
                assert_eq!(status.bytes_sent, 0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let reply = channel.handle(ControlRequest::get_statistics()).await.unwrap();
        match reply {
            ResponsePayload::Statistics(stats) => assert_eq!(stats.server_latency, -1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ControlChannel::new(service(dir.path()).await, DEFAULT_REQUEST_TIMEOUT);

        let request = ControlRequest::update_config(&vless("Tokyo")).unwrap();
        let reply = channel.handle(request).await.unwrap();
        assert_eq!(
            reply,
            ResponsePayload::UpdateConfig(UpdateConfigPayload {
                success: false,
                error: Some("Not connected".to_string()),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_while_connected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        service.connect(vless("Tokyo")).await.unwrap();
        let channel = ControlChannel::new(service.clone(), DEFAULT_REQUEST_TIMEOUT);

        let request = ControlRequest::update_config(&vless("Osaka")).unwrap();
        let reply = channel.handle(request).await.unwrap();
        assert_eq!(reply, ResponsePayload::UpdateConfig(Ok(()).into()));

        match channel.handle(ControlRequest::get_status()).await.unwrap() {
            ResponsePayload::Status(status) => {
                assert!(status.is_connected);
                assert_eq!(status.server_name, "Osaka");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_lifecycle_alone() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        service.connect(vless("Tokyo")).await.unwrap();

        // The engine start grace alone outlasts this timeout
        let channel = ControlChannel::new(service.clone(), Duration::from_millis(100));
        let request = ControlRequest::update_config(&vless("Osaka")).unwrap();
        assert_eq!(channel.handle(request).await, Err(IpcError::Timeout));

        let mut state = service.watch_state();
        state
            .wait_for(|s| *s == LifecycleState::Connected)
            .await
            .unwrap();
        assert_eq!(service.status().server_name.as_deref(), Some("Osaka"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ControlChannel::new(service(dir.path()).await, DEFAULT_REQUEST_TIMEOUT);

        let reply = channel.handle_message(b"{\"type\": \"reboot\"}").await;
        assert!(matches!(
            reply,
            ControlReply::Error {
                code: ErrorCode::Malformed,
                ..
            }
        ));

        let reply = channel.handle_message(b"not json").await;
        assert!(matches!(reply.into_result(), Err(IpcError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let channel = ControlChannel::new(service(dir.path()).await, DEFAULT_REQUEST_TIMEOUT);
        let server = Arc::new(ControlServer::new(channel, &socket, DEFAULT_MAX_MESSAGE_SIZE));

        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.run().await });
        while !socket.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let client = ControlClient::new(&socket, Duration::from_secs(2));
        let status = client.get_status().await.unwrap();
        assert!(!status.is_connected);

        let stats = client.get_statistics().await.unwrap();
        assert_eq!(stats.packets_sent, 0);

        let update = client.update_config(&vless("Tokyo")).await.unwrap();
        assert!(!update.success);

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("control.sock");
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, b"stale").unwrap();

        let channel = ControlChannel::new(service(dir.path()).await, DEFAULT_REQUEST_TIMEOUT);
        let server = Arc::new(ControlServer::new(channel, &socket, DEFAULT_MAX_MESSAGE_SIZE));
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.run().await });

        let client = ControlClient::new(&socket, Duration::from_secs(2));
        let mut status = client.get_status().await;
        for _ in 0..100 {
            if status.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = client.get_status().await;
        }
        assert!(!status.unwrap().is_connected);

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!socket.exists());
        remove_socket(&socket).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let channel = ControlChannel::new(service(dir.path()).await, DEFAULT_REQUEST_TIMEOUT);
        let server = Arc::new(ControlServer::new(channel, &socket, 64));

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });
        while !socket.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.write_all(&1000u32.to_be_bytes()).await.unwrap();

        let body = read_frame(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await.unwrap().unwrap();
        let reply: ControlReply = serde_json::from_slice(&body).unwrap();
        assert!(matches!(reply.into_result(), Err(IpcError::Malformed(_))));
        server.shutdown();
    }
}
