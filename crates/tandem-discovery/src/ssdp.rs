//! UPnP/SSDP search and camera description parsing
//!
//! A camera exposing the ScalarWebAPI answers an `M-SEARCH` multicast with a
//! `LOCATION` header. That URL serves a device description XML whose service
//! list names the JSON-RPC action list URL per service. The control endpoint
//! is the `camera` service's action list URL with `/camera` appended.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::DiscoveryError;

/// SSDP multicast group and port
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// Search target advertised by cameras with the remote control API
pub const SCALAR_WEB_API_ST: &str = "urn:schemas-sony-com:service:ScalarWebAPI:1";

/// Maximum wait (seconds) a responder may delay its answer
pub const DEFAULT_MX: u32 = 10;

/// Default receive timeout for search responses
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

const RECV_BUFFER_SIZE: usize = 2048;

/// Build an `M-SEARCH` request for a search target
pub fn msearch_request(search_target: &str, mx: u32) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, mx, search_target
    )
}

/// Extract the `LOCATION` header of a search response (header name is case-insensitive)
pub fn parse_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// One entry of the description's ScalarWebAPI service list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarService {
    pub service_type: String,
    pub action_list_url: String,
}

#[derive(Clone, Copy)]
enum Field {
    ServiceType,
    ActionListUrl,
}

/// Parse the ScalarWebAPI service list out of a device description document
pub fn parse_description(xml: &str) -> Result<Vec<ScalarService>, DiscoveryError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut services = Vec::new();
    let mut field: Option<Field> = None;
    let mut service_type = String::new();
    let mut action_list_url: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"X_ScalarWebAPI_Service" => {
                    service_type.clear();
                    action_list_url = None;
                }
                b"X_ScalarWebAPI_ServiceType" => field = Some(Field::ServiceType),
                b"X_ScalarWebAPI_ActionList_URL" => field = Some(Field::ActionListUrl),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some(f) = field {
                    let text = t
                        .unescape()
                        .map_err(|e| DiscoveryError::InvalidDescription(e.to_string()))?;
                    match f {
                        Field::ServiceType => service_type = text.trim().to_string(),
                        Field::ActionListUrl => action_list_url = Some(text.trim().to_string()),
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"X_ScalarWebAPI_Service" => {
                    if let Some(url) = action_list_url.take() {
                        services.push(ScalarService {
                            service_type: service_type.clone(),
                            action_list_url: url,
                        });
                    }
                }
                b"X_ScalarWebAPI_ServiceType" | b"X_ScalarWebAPI_ActionList_URL" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DiscoveryError::InvalidDescription(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(services)
}

/// Pick the control endpoint: the `camera` service if listed, else the first one
pub fn camera_endpoint(services: &[ScalarService]) -> Result<String, DiscoveryError> {
    let service = services
        .iter()
        .find(|s| s.service_type == "camera")
        .or_else(|| services.first())
        .ok_or_else(|| {
            DiscoveryError::InvalidDescription("no X_ScalarWebAPI_Service entries".into())
        })?;
    Ok(format!(
        "{}/camera",
        service.action_list_url.trim_end_matches('/')
    ))
}

async fn send_search(target: SocketAddr, search_target: &str) -> Result<UdpSocket, DiscoveryError> {
    let bind: SocketAddr = if target.ip().is_loopback() {
        ([127, 0, 0, 1], 0).into()
    } else {
        ([0, 0, 0, 0], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    let request = msearch_request(search_target, DEFAULT_MX);
    socket.send_to(request.as_bytes(), target).await?;
    trace!(target = %target, st = search_target, "Sent M-SEARCH");
    Ok(socket)
}

/// Send one search to `target` and return every distinct location heard before `window` ends
pub async fn search_at(
    target: SocketAddr,
    search_target: &str,
    window: Duration,
) -> Result<Vec<String>, DiscoveryError> {
    let socket = send_search(target, search_target).await?;
    let deadline = Instant::now() + window;
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let mut locations = Vec::new();

    while let Ok(received) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let (len, from) = received?;
        let response = String::from_utf8_lossy(&buf[..len]);
        match parse_location(&response) {
            Some(location) if !locations.contains(&location) => {
                debug!(from = %from, location = %location, "SSDP response");
                locations.push(location);
            }
            Some(_) => {}
            None => trace!(from = %from, "SSDP response without LOCATION"),
        }
    }

    Ok(locations)
}

/// Send one search to `target` and return the first location that answers
pub async fn find_first_at(
    target: SocketAddr,
    search_target: &str,
    receive_timeout: Duration,
) -> Result<String, DiscoveryError> {
    let socket = send_search(target, search_target).await?;
    let deadline = Instant::now() + receive_timeout;
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| {
                DiscoveryError::NotFound(format!(
                    "no {} response within {:?}",
                    search_target, receive_timeout
                ))
            })?;
        let (len, from) = received?;
        if let Some(location) = parse_location(&String::from_utf8_lossy(&buf[..len])) {
            debug!(from = %from, location = %location, "SSDP response");
            return Ok(location);
        }
    }
}

fn multicast_target() -> Result<SocketAddr, DiscoveryError> {
    SSDP_MULTICAST_ADDR
        .parse()
        .map_err(|_| DiscoveryError::NotFound("invalid SSDP multicast address".into()))
}

/// Multicast search collecting every location that answers within `window`
pub async fn search(search_target: &str, window: Duration) -> Result<Vec<String>, DiscoveryError> {
    search_at(multicast_target()?, search_target, window).await
}

/// Fetch a description document and resolve the camera control endpoint
pub async fn fetch_camera_endpoint(
    client: &reqwest::Client,
    location: &str,
) -> Result<String, DiscoveryError> {
    let body = client
        .get(location)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let services = parse_description(&body)?;
    camera_endpoint(&services)
}

/// Full camera discovery: multicast search, then description fetch and parse
pub async fn discover_camera_endpoint(
    client: &reqwest::Client,
    receive_timeout: Duration,
) -> Result<String, DiscoveryError> {
    let location = find_first_at(multicast_target()?, SCALAR_WEB_API_ST, receive_timeout).await?;
    let endpoint = fetch_camera_endpoint(client, &location).await?;
    info!(location = %location, endpoint = %endpoint, "Camera endpoint discovered");
    Ok(endpoint)
}
