//! Wi-Fi camera with a JSON-RPC remote control API
//!
//! Every command is `{"method", "params", "id", "version"}` POSTed to the
//! camera endpoint. A response carrying an `"error": [code, message]` field is
//! a rejection; the code maps onto [`CameraErrorCode`], and a code outside
//! that table is a protocol violation.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tandem_core::{
    CameraErrorCode, Capture, DeviceAddress, DeviceClient, DeviceError, DeviceKind, Locator,
    ProtocolError,
};
use tandem_discovery::ssdp;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Value,
    id: u32,
    version: &'static str,
}

/// Fail on an `"error"` field, otherwise hand back the parsed body
pub fn check_response(body: Value) -> Result<Value, DeviceError> {
    if let Some(error) = body.get("error") {
        let code = error.get(0).and_then(Value::as_i64).ok_or_else(|| {
            DeviceError::ProtocolViolation(format!("malformed error field: {}", error))
        })?;
        return match CameraErrorCode::from_code(code) {
            Some(code) => Err(ProtocolError::Camera(code).into()),
            None => Err(DeviceError::ProtocolViolation(format!(
                "unknown camera error code {}",
                code
            ))),
        };
    }
    Ok(body)
}

/// First element of a response's `result` array
fn first_result(body: &Value) -> Option<&Value> {
    body.get("result").and_then(|r| r.get(0))
}

pub struct JsonRpcCameraClient {
    http: reqwest::Client,
    http_timeout: Duration,
    upnp_timeout: Duration,
    teardown_timeout: Duration,
    endpoint: Option<String>,
    available: Vec<String>,
    rec_mode: bool,
    connected: bool,
}

impl JsonRpcCameraClient {
    /// `http` should carry its own request timeout, passed again as `http_timeout` for reporting
    pub fn new(http: reqwest::Client, http_timeout: Duration, upnp_timeout: Duration) -> Self {
        Self {
            http,
            http_timeout,
            upnp_timeout,
            teardown_timeout: http_timeout,
            endpoint: None,
            available: Vec::new(),
            rec_mode: false,
            connected: false,
        }
    }

    /// Bound for the best-effort `stopRecMode` sent on disconnect
    pub fn with_teardown_timeout(mut self, limit: Duration) -> Self {
        self.teardown_timeout = limit;
        self
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// API methods the camera reported on connect
    pub fn available_apis(&self) -> &[String] {
        &self.available
    }

    fn supports(&self, method: &str) -> bool {
        self.available.is_empty() || self.available.iter().any(|m| m == method)
    }

    fn map_http(err: reqwest::Error, limit: Duration) -> DeviceError {
        if err.is_timeout() {
            DeviceError::ConnectionTimeout(limit)
        } else if err.is_decode() {
            DeviceError::ProtocolViolation(err.to_string())
        } else {
            DeviceError::Transport(err.to_string())
        }
    }

    /// Invoke any API method and return the checked response body
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, DeviceError> {
        self.call_within(method, params, self.http_timeout).await
    }

    async fn call_within(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value, DeviceError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| DeviceError::InvalidState("camera endpoint unknown".into()))?;

        let request = RpcRequest {
            method,
            params,
            id: 1,
            version: "1.0",
        };
        debug!(endpoint = %endpoint, method = method, "Camera call");

        let response = self
            .http
            .post(endpoint)
            .json(&request)
            .timeout(limit)
            .send()
            .await
            .map_err(|e| Self::map_http(e, limit))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::ProtocolViolation(format!(
                "{} answered HTTP {}",
                method, status
            )));
        }
        let body: Value = response.json().await.map_err(|e| Self::map_http(e, limit))?;
        check_response(body)
    }

    async fn ensure_movie_mode(&self) -> Result<(), DeviceError> {
        if !self.supports("getShootMode") {
            return Ok(());
        }
        let body = self.call("getShootMode", json!([])).await?;
        let mode = first_result(&body).and_then(Value::as_str).unwrap_or_default();
        if mode != "movie" {
            info!(mode = mode, "Switching camera to movie mode");
            self.call("setShootMode", json!(["movie"])).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for JsonRpcCameraClient {
    fn kind(&self) -> DeviceKind {
        DeviceKind::JsonRpcCamera
    }

    async fn discover(&mut self, locator: &Locator) -> Result<DeviceAddress, DeviceError> {
        match locator {
            Locator::Upnp {
                camera_url: Some(url),
            } => Ok(DeviceAddress::Url(url.clone())),
            Locator::Upnp { camera_url: None } => {
                let endpoint = ssdp::discover_camera_endpoint(&self.http, self.upnp_timeout).await?;
                Ok(DeviceAddress::Url(endpoint))
            }
            other => Err(DeviceError::UnsupportedOperation(format!(
                "JSON-RPC camera is located by UPnP, got {:?}",
                other
            ))),
        }
    }

    async fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError> {
        let DeviceAddress::Url(url) = address else {
            return Err(DeviceError::InvalidState(format!(
                "JSON-RPC camera cannot connect to {}",
                address
            )));
        };
        if self.connected && self.endpoint.as_deref() == Some(url.as_str()) {
            return Ok(());
        }

        self.endpoint = Some(url.clone());
        let body = self.call("getAvailableApiList", json!([])).await?;
        self.available = first_result(&body)
            .and_then(Value::as_array)
            .map(|methods| {
                methods
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if self.available.iter().any(|m| m == "startRecMode") {
            self.call("startRecMode", json!([])).await?;
            self.rec_mode = true;
        }

        self.connected = true;
        info!(
            endpoint = %url,
            apis = self.available.len(),
            rec_mode = self.rec_mode,
            "Camera connected"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn start_recording(&mut self) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::InvalidState("camera not connected".into()));
        }
        self.ensure_movie_mode().await?;
        self.call("startMovieRec", json!([])).await?;
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Capture, DeviceError> {
        if !self.connected {
            return Err(DeviceError::InvalidState("camera not connected".into()));
        }
        self.call("stopMovieRec", json!([])).await?;
        Ok(Capture::Acknowledged)
    }

    async fn disconnect(&mut self) {
        if self.rec_mode {
            let limit = self.teardown_timeout.min(self.http_timeout);
            if let Err(e) = self.call_within("stopRecMode", json!([]), limit).await {
                warn!(error = %e, "Failed to leave rec mode");
            }
            self.rec_mode = false;
        }
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn find_header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    /// Read one HTTP request and return its body
    async fn read_request(stream: &mut TcpStream) -> Option<String> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(end) = find_header_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let len = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.trim().eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                while buf.len() < end + 4 + len {
                    let n = stream.read(&mut chunk).await.ok()?;
                    if n == 0 {
                        return None;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                return Some(String::from_utf8_lossy(&buf[end + 4..end + 4 + len]).to_string());
            }
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Minimal camera: answers each method from a table, logs every request body
    async fn fake_camera(answers: HashMap<&'static str, Value>) -> (String, Arc<Mutex<Vec<Value>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sony/camera", listener.local_addr().unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));
        let requests = log.clone();
        let answers = Arc::new(answers);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let requests = requests.clone();
                let answers = answers.clone();
                tokio::spawn(async move {
                    while let Some(body) = read_request(&mut stream).await {
                        let request: Value = serde_json::from_str(&body).unwrap();
                        let method = request["method"].as_str().unwrap_or_default().to_string();
                        requests.lock().unwrap().push(request);
                        let answer = answers
                            .get(method.as_str())
                            .cloned()
                            .unwrap_or_else(|| json!({"result": [0], "id": 1}));
                        // A null answer stands for a camera that never replies
                        if answer.is_null() {
                            std::future::pending::<()>().await;
                        }
                        let payload = answer.to_string();
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                            payload.len(),
                            payload
                        );
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (url, log)
    }

    fn client() -> JsonRpcCameraClient {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        JsonRpcCameraClient::new(http, Duration::from_secs(5), Duration::from_secs(1))
    }

    fn methods(log: &Arc<Mutex<Vec<Value>>>) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .map(|r| r["method"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_camera_not_ready_maps_to_protocol_error() {
        let err = check_response(json!({"error": [40401, "Camera Not Ready"], "id": 1})).unwrap_err();
        assert_eq!(
            err,
            DeviceError::Protocol(ProtocolError::Camera(CameraErrorCode::CameraNotReady))
        );
    }

    #[test]
    fn test_response_without_error_is_returned() {
        let body = json!({"result": [["movie", "still"]], "id": 1});
        assert_eq!(check_response(body.clone()).unwrap(), body);
    }

    #[test]
    fn test_unknown_or_malformed_error_is_a_violation() {
        assert!(matches!(
            check_response(json!({"error": [99999, "?"]})),
            Err(DeviceError::ProtocolViolation(_))
        ));
        assert!(matches!(
            check_response(json!({"error": "oops"})),
            Err(DeviceError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_recording_cycle_call_sequence() {
        let mut answers = HashMap::new();
        answers.insert(
            "getAvailableApiList",
            json!({"result": [["getAvailableApiList", "startRecMode", "stopRecMode",
                "getShootMode", "setShootMode", "startMovieRec", "stopMovieRec"]], "id": 1}),
        );
        answers.insert("getShootMode", json!({"result": ["still"], "id": 1}));
        let (url, log) = fake_camera(answers).await;

        let mut camera = client();
        let address = camera
            .discover(&Locator::Upnp {
                camera_url: Some(url.clone()),
            })
            .await
            .unwrap();
        assert_eq!(address, DeviceAddress::Url(url));

        camera.connect(&address).await.unwrap();
        camera.connect(&address).await.unwrap();
        camera.start_recording().await.unwrap();
        assert_eq!(camera.stop_recording().await.unwrap(), Capture::Acknowledged);
        camera.disconnect().await;

        assert_eq!(
            methods(&log),
            vec![
                "getAvailableApiList",
                "startRecMode",
                "getShootMode",
                "setShootMode",
                "startMovieRec",
                "stopMovieRec",
                "stopRecMode",
            ]
        );
        let requests = log.lock().unwrap();
        assert_eq!(requests[3]["params"], json!(["movie"]));
        assert_eq!(requests[0]["version"], json!("1.0"));
        assert_eq!(requests[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_start_rejected_when_camera_not_ready() {
        let mut answers = HashMap::new();
        answers.insert(
            "getAvailableApiList",
            json!({"result": [["startMovieRec", "stopMovieRec"]], "id": 1}),
        );
        answers.insert("startMovieRec", json!({"error": [40401, "Not Ready"], "id": 1}));
        let (url, log) = fake_camera(answers).await;

        let mut camera = client();
        camera.connect(&DeviceAddress::Url(url)).await.unwrap();
        let err = camera.start_recording().await.unwrap_err();
        assert_eq!(
            err,
            DeviceError::Protocol(ProtocolError::Camera(CameraErrorCode::CameraNotReady))
        );
        // No rec mode or shoot mode calls on a camera that does not list them
        assert_eq!(methods(&log), vec!["getAvailableApiList", "startMovieRec"]);
    }

    #[tokio::test]
    async fn test_call_before_connect() {
        let camera = client();
        assert!(matches!(
            camera.call("getEvent", json!([false])).await,
            Err(DeviceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_bounds_stuck_rec_mode_exit() {
        let mut answers = HashMap::new();
        answers.insert(
            "getAvailableApiList",
            json!({"result": [["startRecMode", "stopRecMode"]], "id": 1}),
        );
        answers.insert("stopRecMode", Value::Null);
        let (url, log) = fake_camera(answers).await;

        let mut camera = client().with_teardown_timeout(Duration::from_millis(200));
        camera.connect(&DeviceAddress::Url(url)).await.unwrap();

        let started = std::time::Instant::now();
        camera.disconnect().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!camera.is_connected());
        assert_eq!(
            methods(&log),
            vec!["getAvailableApiList", "startRecMode", "stopRecMode"]
        );
    }
}
