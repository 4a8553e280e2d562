//! Camera discovery.
//!
//! `DeviceProtocolClient::discover` learns a camera's faces in three steps:
//!
//! 1. Ask the media service for encoder configurations (name -> resolution). An
//!    encoder whose name contains "unistream" marks a single-stream device.
//! 2. Send a raw DESCRIBE for the mosaic (or high-resolution immersive/unistream) URL
//!    to the camera's RTSP port and parse the session description (`sdp`).
//! 3. Attach resolutions by matching each stream's terminal path against the encoder
//!    names, then classify the stream signature into a `CameraType`.
//!
//! The resulting `StreamDescriptor`s are what `StreamSession`s are built from.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CameraType, Face};

pub mod onvif;
pub mod sdp;

pub use onvif::{EncoderConfiguration, MediaConfigSource, StaticMediaConfig};
pub use sdp::{parse_streams, DescribeContext, SdpStream};

/// Default RTSP port for DESCRIBE requests.
pub const DEFAULT_RTSP_PORT: u16 = 554;

const MAX_RESPONSE_BYTES: usize = 64 * 1024;

// ----------------------------------------------------------------------------
// Types
// ----------------------------------------------------------------------------

/// How to reach one camera.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConnection {
    #[serde(default)]
    pub name: String,
    pub ip_address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Request the immersive (or unistream) high-resolution stream instead of the mosaic.
    #[serde(default)]
    pub use_high_res_stream: bool,
}

impl CameraConnection {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// One face stream as discovered (or loaded from a fixed image).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub face: Face,
    pub endpoint: String,
    /// Opaque; forwarded to the rendering engine verbatim.
    pub layout_metadata: String,
    pub width: u32,
    pub height: u32,
}

impl StreamDescriptor {
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("camera {address} unreachable: {source}")]
    Network {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("camera {0} did not answer in time")]
    Timeout(String),
    #[error("DESCRIBE rejected: {0}")]
    Rejected(String),
    #[error("malformed session description: {0}")]
    MalformedResponse(String),
    #[error("camera reported no usable video streams")]
    NoUsableStreams,
    #[error("unsupported camera: {streams} stream(s) with an unrecognised resolution signature")]
    UnsupportedCamera { streams: usize },
    #[error("media service query failed: {0}")]
    MediaService(String),
    #[error("{0} requires the onvif feature")]
    FeatureDisabled(&'static str),
}

fn io_error(address: &str, source: std::io::Error) -> DiscoveryError {
    match source.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            DiscoveryError::Timeout(address.to_string())
        }
        _ => DiscoveryError::Network {
            address: address.to_string(),
            source,
        },
    }
}

// ----------------------------------------------------------------------------
// Pure helpers
// ----------------------------------------------------------------------------

/// Face identity from endpoint text. First match wins, case-insensitive:
/// back, down, front, left, mosaic/unistream, right, up.
pub fn face_from_endpoint(endpoint: &str) -> Face {
    const ORDER: [(&str, Face); 8] = [
        ("back", Face::Back),
        ("down", Face::Down),
        ("front", Face::Front),
        ("left", Face::Left),
        ("mosaic", Face::Mosaic),
        ("unistream", Face::Mosaic),
        ("right", Face::Right),
        ("up", Face::Up),
    ];
    let endpoint = endpoint.to_lowercase();
    ORDER
        .iter()
        .find(|(needle, _)| endpoint.contains(needle))
        .map(|(_, face)| *face)
        .unwrap_or(Face::Illegal)
}

/// Camera geometry from the stream signature: the count, and for a single stream its
/// resolution.
pub fn classify(resolutions: &[(u32, u32)]) -> CameraType {
    match resolutions {
        [single] => match *single {
            (1280, 1288) | (4064, 4096) => CameraType::Optera180,
            (864, 2680) | (2144, 6656) => CameraType::Optera270,
            (800, 2680) | (2048, 6880) => CameraType::Optera360,
            _ => CameraType::Unknown,
        },
        _ => match resolutions.len() {
            2 => CameraType::Optera180,
            4 => CameraType::Optera270,
            5 => CameraType::Optera360,
            _ => CameraType::Unknown,
        },
    }
}

pub fn classify_streams(streams: &[StreamDescriptor]) -> CameraType {
    let resolutions: Vec<(u32, u32)> = streams.iter().map(StreamDescriptor::resolution).collect();
    classify(&resolutions)
}

/// URL the DESCRIBE goes to.
pub fn describe_url(camera: &CameraConnection, unistream: bool) -> String {
    let path = match (camera.use_high_res_stream, unistream) {
        (false, _) => "mosaic",
        (true, false) => "immersive",
        (true, true) => "unistream_v",
    };
    format!("rtsp://{}/{}", camera.ip_address, path)
}

/// Attach encoder resolutions (matched by path, case-insensitive; 0x0 if unmatched).
pub fn resolve_streams(
    streams: Vec<SdpStream>,
    configurations: &[EncoderConfiguration],
) -> Vec<StreamDescriptor> {
    streams
        .into_iter()
        .map(|stream| {
            let (width, height) = configurations
                .iter()
                .find(|cfg| cfg.name.eq_ignore_ascii_case(&stream.path))
                .map(|cfg| (cfg.width, cfg.height))
                .unwrap_or((0, 0));
            StreamDescriptor {
                face: face_from_endpoint(&stream.endpoint),
                endpoint: stream.endpoint,
                layout_metadata: stream.layout_metadata,
                width,
                height,
            }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// DeviceProtocolClient
// ----------------------------------------------------------------------------

/// Queries a camera for its face endpoints, resolutions and layout metadata.
pub struct DeviceProtocolClient {
    rtsp_port: u16,
    timeout: Duration,
    media: Box<dyn MediaConfigSource>,
}

impl DeviceProtocolClient {
    pub fn new(media: Box<dyn MediaConfigSource>) -> Self {
        Self {
            rtsp_port: DEFAULT_RTSP_PORT,
            timeout: Duration::from_secs(5),
            media,
        }
    }

    /// Client backed by the camera's ONVIF media service.
    #[cfg(feature = "onvif")]
    pub fn onvif(timeout: Duration) -> Result<Self, DiscoveryError> {
        Ok(Self::new(Box::new(onvif::OnvifMediaClient::new(timeout))).with_timeout(timeout))
    }

    #[cfg(not(feature = "onvif"))]
    pub fn onvif(_timeout: Duration) -> Result<Self, DiscoveryError> {
        Err(DiscoveryError::FeatureDisabled("ONVIF media queries"))
    }

    pub fn with_rtsp_port(mut self, port: u16) -> Self {
        self.rtsp_port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn discover(
        &self,
        camera: &CameraConnection,
    ) -> Result<(CameraType, Vec<StreamDescriptor>), DiscoveryError> {
        let configurations = self.media.video_encoder_configurations(camera)?;
        let unistream = configurations
            .iter()
            .any(|cfg| cfg.name.to_lowercase().contains("unistream"));
        let url = describe_url(camera, unistream);

        let body = self.describe(camera, &url)?;
        if body.trim().is_empty() {
            return Err(DiscoveryError::MalformedResponse(
                "empty session description".to_string(),
            ));
        }
        let ctx = DescribeContext {
            host: &camera.ip_address,
            request_url: &url,
            unistream,
        };
        let streams = resolve_streams(parse_streams(&body, &ctx), &configurations);
        if streams.is_empty() {
            return Err(DiscoveryError::NoUsableStreams);
        }

        let camera_type = classify_streams(&streams);
        if camera_type == CameraType::Unknown {
            return Err(DiscoveryError::UnsupportedCamera {
                streams: streams.len(),
            });
        }
        log::info!(
            "camera {}: {:?} with {} stream(s)",
            camera.ip_address,
            camera_type,
            streams.len()
        );
        Ok((camera_type, streams))
    }

    /// Send DESCRIBE to the camera's RTSP port and return the session description body.
    pub fn describe(&self, camera: &CameraConnection, url: &str) -> Result<String, DiscoveryError> {
        let address = format!("{}:{}", camera.ip_address, self.rtsp_port);
        let socket_addr = (camera.ip_address.as_str(), self.rtsp_port)
            .to_socket_addrs()
            .map_err(|err| io_error(&address, err))?
            .next()
            .ok_or_else(|| DiscoveryError::Network {
                address: address.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
            })?;

        let mut stream = TcpStream::connect_timeout(&socket_addr, self.timeout)
            .map_err(|err| io_error(&address, err))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|err| io_error(&address, err))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|err| io_error(&address, err))?;

        stream
            .write_all(describe_request(url, camera).as_bytes())
            .map_err(|err| io_error(&address, err))?;
        read_describe_response(&mut stream, &address)
    }
}

impl std::fmt::Debug for DeviceProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProtocolClient")
            .field("rtsp_port", &self.rtsp_port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn describe_request(url: &str, camera: &CameraConnection) -> String {
    let mut request = format!(
        "DESCRIBE {url} RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: panoview/{}\r\nAccept: application/sdp\r\n",
        env!("CARGO_PKG_VERSION")
    );
    if camera.has_credentials() {
        let auth = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{}:{}", camera.username, camera.password),
        );
        request.push_str(&format!("Authorization: Basic {auth}\r\n"));
    }
    request.push_str("\r\n");
    request
}

fn header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn content_length(head: &str) -> Option<usize> {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Read an RTSP response: headers, then `Content-Length` bytes of body (or until the
/// peer closes or goes quiet when no length is given).
fn read_describe_response(stream: &mut impl Read, address: &str) -> Result<String, DiscoveryError> {
    let mut buf = [0u8; 2048];
    let mut data = Vec::new();
    let mut expected: Option<usize> = None;
    let mut head_len: Option<usize> = None;
    loop {
        if expected.is_some_and(|total| data.len() >= total) {
            break;
        }
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err)
                if head_len.is_some()
                    && matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
            {
                break
            }
            Err(err) => return Err(io_error(address, err)),
        };
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_RESPONSE_BYTES {
            return Err(DiscoveryError::MalformedResponse("response too large".to_string()));
        }
        if head_len.is_none() {
            if let Some(end) = header_end(&data) {
                head_len = Some(end);
                let head = String::from_utf8_lossy(&data[..end]);
                expected = content_length(&head).map(|len| end + len);
            }
        }
    }

    let end = head_len.ok_or_else(|| {
        DiscoveryError::MalformedResponse("incomplete response header".to_string())
    })?;
    let head = String::from_utf8_lossy(&data[..end]);
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let protocol = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !protocol.starts_with("RTSP/") {
        return Err(DiscoveryError::MalformedResponse(format!(
            "unexpected status line '{status_line}'"
        )));
    }
    if code != "200" {
        return Err(DiscoveryError::Rejected(status_line.trim().to_string()));
    }
    let body_end = expected.unwrap_or(data.len()).min(data.len());
    Ok(String::from_utf8_lossy(&data[end..body_end]).into_owned())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn classify_matches_signature_table() {
        use CameraType::*;
        let cases: &[(&[(u32, u32)], CameraType)] = &[
            (&[(1280, 1288)], Optera180),
            (&[(4064, 4096)], Optera180),
            (&[(864, 2680)], Optera270),
            (&[(2144, 6656)], Optera270),
            (&[(800, 2680)], Optera360),
            (&[(2048, 6880)], Optera360),
            (&[(1920, 1080)], Unknown),
            (&[(0, 0), (0, 0)], Optera180),
            (&[(1, 1); 4], Optera270),
            (&[(1, 1); 5], Optera360),
            (&[(1, 1); 3], Unknown),
            (&[(1, 1); 6], Unknown),
            (&[], Unknown),
        ];
        for (resolutions, expected) in cases {
            assert_eq!(classify(resolutions), *expected, "{:?}", resolutions);
        }
    }

    #[test]
    fn face_priority_is_fixed() {
        assert_eq!(face_from_endpoint("rtsp://cam/back_mosaic"), Face::Back);
        assert_eq!(face_from_endpoint("rtsp://cam/MOSAIC"), Face::Mosaic);
        assert_eq!(face_from_endpoint("rtsp://cam/unistream_v"), Face::Mosaic);
        assert_eq!(face_from_endpoint("rtsp://cam/upright"), Face::Right);
        assert_eq!(face_from_endpoint("rtsp://cam/Left_v"), Face::Left);
        assert_eq!(face_from_endpoint("rtsp://cam/up_v"), Face::Up);
        assert_eq!(face_from_endpoint("rtsp://cam/stream1"), Face::Illegal);
    }

    #[test]
    fn describe_url_selection() {
        let mut camera = CameraConnection {
            ip_address: "10.0.0.5".to_string(),
            ..Default::default()
        };
        assert_eq!(describe_url(&camera, true), "rtsp://10.0.0.5/mosaic");
        camera.use_high_res_stream = true;
        assert_eq!(describe_url(&camera, false), "rtsp://10.0.0.5/immersive");
        assert_eq!(describe_url(&camera, true), "rtsp://10.0.0.5/unistream_v");
    }

    #[test]
    fn describe_request_adds_basic_auth_only_with_credentials() {
        let mut camera = CameraConnection {
            ip_address: "cam".to_string(),
            ..Default::default()
        };
        let plain = describe_request("rtsp://cam/mosaic", &camera);
        assert!(plain.starts_with("DESCRIBE rtsp://cam/mosaic RTSP/1.0\r\nCSeq: 1\r\n"));
        assert!(plain.contains("Accept: application/sdp\r\n"));
        assert!(!plain.contains("Authorization"));
        assert!(plain.ends_with("\r\n\r\n"));

        camera.username = "admin".to_string();
        camera.password = "admin".to_string();
        let authed = describe_request("rtsp://cam/mosaic", &camera);
        assert!(authed.contains("Authorization: Basic YWRtaW46YWRtaW4=\r\n"));
    }

    #[test]
    fn resolutions_attach_by_case_insensitive_path() {
        let streams = vec![
            SdpStream {
                endpoint: "rtsp://cam/front_v".to_string(),
                path: "front_v".to_string(),
                layout_metadata: "f".to_string(),
            },
            SdpStream {
                endpoint: "rtsp://cam/left_v".to_string(),
                path: "left_v".to_string(),
                layout_metadata: "l".to_string(),
            },
        ];
        let configs = vec![EncoderConfiguration::new("FRONT_V", 864, 2680)];
        let descriptors = resolve_streams(streams, &configs);
        assert_eq!(descriptors[0].face, Face::Front);
        assert_eq!(descriptors[0].resolution(), (864, 2680));
        assert_eq!(descriptors[1].resolution(), (0, 0));
    }

    #[test]
    fn response_body_honours_content_length() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 5\r\n\r\nv=0\r\nTRAILING";
        let body = read_describe_response(&mut Cursor::new(&raw[..]), "cam").unwrap();
        assert_eq!(body, "v=0\r\n");
    }

    #[test]
    fn response_without_length_reads_to_eof() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\nv=0\r\nm=video 0\r\n";
        let body = read_describe_response(&mut Cursor::new(&raw[..]), "cam").unwrap();
        assert_eq!(body, "v=0\r\nm=video 0\r\n");
    }

    #[test]
    fn non_200_is_rejected() {
        let raw = b"RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\n\r\n";
        let err = read_describe_response(&mut Cursor::new(&raw[..]), "cam").unwrap_err();
        assert!(matches!(err, DiscoveryError::Rejected(ref s) if s.contains("401")));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq";
        let err = read_describe_response(&mut Cursor::new(&raw[..]), "cam").unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedResponse(_)));
    }
}
