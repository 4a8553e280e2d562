//! Video encoder configurations (encoder name -> resolution).
//!
//! The camera's media service answers `GetVideoEncoderConfigurations`; the encoder
//! names double as stream path names, which is how per-face resolutions are found.
//! The SOAP client needs the `onvif` feature; the response parser is always built.

use regex::Regex;

use super::{CameraConnection, DiscoveryError};

/// One encoder as reported by the media service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderConfiguration {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl EncoderConfiguration {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
        }
    }

    /// Parse `name=WIDTHxHEIGHT`.
    pub fn parse_spec(spec: &str) -> Option<Self> {
        let (name, size) = spec.split_once('=')?;
        let (w, h) = size.split_once(['x', 'X'])?;
        Some(Self::new(name.trim(), w.trim().parse().ok()?, h.trim().parse().ok()?))
    }
}

/// Source of encoder configurations for a camera.
pub trait MediaConfigSource: Send + Sync {
    fn video_encoder_configurations(
        &self,
        camera: &CameraConnection,
    ) -> Result<Vec<EncoderConfiguration>, DiscoveryError>;
}

/// Fixed configuration list, for cameras without a reachable media service.
#[derive(Clone, Debug, Default)]
pub struct StaticMediaConfig {
    configurations: Vec<EncoderConfiguration>,
}

impl StaticMediaConfig {
    pub fn new(configurations: Vec<EncoderConfiguration>) -> Self {
        Self { configurations }
    }
}

impl MediaConfigSource for StaticMediaConfig {
    fn video_encoder_configurations(
        &self,
        _camera: &CameraConnection,
    ) -> Result<Vec<EncoderConfiguration>, DiscoveryError> {
        Ok(self.configurations.clone())
    }
}

// ----------------------------------------------------------------------------
// Response parsing
// ----------------------------------------------------------------------------

/// Extract every `Configurations` element of a `GetVideoEncoderConfigurationsResponse`,
/// ignoring namespace prefixes.
pub fn parse_encoder_configurations(
    xml: &str,
) -> Result<Vec<EncoderConfiguration>, DiscoveryError> {
    if xml.contains(":Fault>") || xml.contains("<Fault>") {
        let reason = xml_value(xml, "Text").unwrap_or_else(|| "SOAP fault".to_string());
        return Err(DiscoveryError::MediaService(reason));
    }

    let block = Regex::new(
        r"(?s)<(?:[A-Za-z0-9_]+:)?Configurations\b[^>]*>(.*?)</(?:[A-Za-z0-9_]+:)?Configurations>",
    )
    .map_err(|err| DiscoveryError::MediaService(err.to_string()))?;

    let mut configurations = Vec::new();
    for captures in block.captures_iter(xml) {
        let body = &captures[1];
        let Some(name) = xml_value(body, "Name") else {
            continue;
        };
        let width = xml_value(body, "Width")
            .and_then(|w| w.trim().parse().ok())
            .unwrap_or(0);
        let height = xml_value(body, "Height")
            .and_then(|h| h.trim().parse().ok())
            .unwrap_or(0);
        configurations.push(EncoderConfiguration::new(name.trim(), width, height));
    }
    Ok(configurations)
}

/// Text content of the first `<tag>` (any namespace prefix).
fn xml_value(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"(?s)<(?:[A-Za-z0-9_]+:)?{tag}\b[^>]*>([^<]*)</(?:[A-Za-z0-9_]+:)?{tag}>",
        tag = regex::escape(tag)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml).map(|c| c[1].to_string())
}

// ----------------------------------------------------------------------------
// SOAP client (feature: onvif)
// ----------------------------------------------------------------------------

#[cfg(feature = "onvif")]
pub use client::OnvifMediaClient;

#[cfg(feature = "onvif")]
mod client {
    use std::time::Duration;

    use rand::Rng;
    use sha1::{Digest, Sha1};

    use super::{parse_encoder_configurations, EncoderConfiguration, MediaConfigSource};
    use crate::discovery::{CameraConnection, DiscoveryError};

    /// `GetVideoEncoderConfigurations` over SOAP 1.2 with a WS-Security digest.
    #[derive(Clone, Debug)]
    pub struct OnvifMediaClient {
        timeout: Duration,
    }

    impl OnvifMediaClient {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }
    }

    impl MediaConfigSource for OnvifMediaClient {
        fn video_encoder_configurations(
            &self,
            camera: &CameraConnection,
        ) -> Result<Vec<EncoderConfiguration>, DiscoveryError> {
            let header = if camera.username.is_empty() || camera.password.is_empty() {
                String::new()
            } else {
                security_header(&camera.username, &camera.password)
            };
            let body = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Header>{header}</s:Header>
  <s:Body>
    <GetVideoEncoderConfigurations xmlns="http://www.onvif.org/ver10/media/wsdl"/>
  </s:Body>
</s:Envelope>"#
            );

            let url = format!("http://{}/onvif/media_service", camera.ip_address);
            let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
            let response = agent
                .post(&url)
                .set("Content-Type", "application/soap+xml; charset=utf-8")
                .send_string(&body);
            let text = match response {
                Ok(response) => response
                    .into_string()
                    .map_err(|err| DiscoveryError::MediaService(err.to_string()))?,
                Err(ureq::Error::Status(code, response)) => {
                    let text = response.into_string().unwrap_or_default();
                    if let Err(fault) = parse_encoder_configurations(&text) {
                        return Err(fault);
                    }
                    return Err(DiscoveryError::MediaService(format!(
                        "{url} answered HTTP {code}"
                    )));
                }
                Err(err) => return Err(DiscoveryError::MediaService(err.to_string())),
            };
            parse_encoder_configurations(&text)
        }
    }

    /// WS-Security UsernameToken: PasswordDigest = Base64(SHA1(nonce + created + password)).
    pub(super) fn security_header(username: &str, password: &str) -> String {
        let nonce: [u8; 16] = rand::thread_rng().gen();
        let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let digest = password_digest(&nonce, &created, password);
        let nonce_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, nonce);
        format!(
            r##"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"><wsse:UsernameToken><wsse:Username>{username}</wsse:Username><wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{digest}</wsse:Password><wsse:Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{nonce_b64}</wsse:Nonce><wsu:Created>{created}</wsu:Created></wsse:UsernameToken></wsse:Security>"##
        )
    }

    pub(super) fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(nonce);
        hasher.update(created.as_bytes());
        hasher.update(password.as_bytes());
        base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            hasher.finalize(),
        )
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn digest_matches_known_vector() {
            // nonce/created/password from the WS-Security UsernameToken profile example
            let nonce = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                "LKqI6G/AikKCQrN0zqZFlg==",
            )
            .unwrap();
            let digest = password_digest(&nonce, "2010-09-16T07:50:45Z", "userpassword");
            assert_eq!(digest, "tuOSpGlFlIXsozq4HFNeeGeFLEI=");
        }

        #[test]
        fn header_carries_username_and_fresh_nonce() {
            let a = security_header("admin", "secret");
            let b = security_header("admin", "secret");
            assert!(a.contains("<wsse:Username>admin</wsse:Username>"));
            assert_ne!(a, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">
<SOAP-ENV:Body><trt:GetVideoEncoderConfigurationsResponse>
<trt:Configurations token="enc0"><tt:Name>front_v</tt:Name><tt:UseCount>1</tt:UseCount><tt:Encoding>H264</tt:Encoding>
<tt:Resolution><tt:Width>864</tt:Width><tt:Height>2680</tt:Height></tt:Resolution></trt:Configurations>
<trt:Configurations token="enc1"><tt:Name>Unistream_V</tt:Name>
<tt:Resolution><tt:Width>2048</tt:Width><tt:Height>6880</tt:Height></tt:Resolution></trt:Configurations>
</trt:GetVideoEncoderConfigurationsResponse></SOAP-ENV:Body></SOAP-ENV:Envelope>"#;

    #[test]
    fn parses_configurations_regardless_of_prefix() {
        let configs = parse_encoder_configurations(RESPONSE).unwrap();
        assert_eq!(
            configs,
            vec![
                EncoderConfiguration::new("front_v", 864, 2680),
                EncoderConfiguration::new("Unistream_V", 2048, 6880),
            ]
        );
        let bare = "<Configurations><Name>mosaic</Name><Width>800</Width><Height>2680</Height></Configurations>";
        assert_eq!(
            parse_encoder_configurations(bare).unwrap(),
            vec![EncoderConfiguration::new("mosaic", 800, 2680)]
        );
    }

    #[test]
    fn soap_fault_is_media_service_error() {
        let fault = r#"<s:Envelope><s:Body><s:Fault><s:Reason><s:Text xml:lang="en">Sender not authorized</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;
        match parse_encoder_configurations(fault) {
            Err(DiscoveryError::MediaService(reason)) => {
                assert_eq!(reason, "Sender not authorized")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn encoder_spec_parsing() {
        assert_eq!(
            EncoderConfiguration::parse_spec("mosaic=800x2680"),
            Some(EncoderConfiguration::new("mosaic", 800, 2680))
        );
        assert!(EncoderConfiguration::parse_spec("mosaic").is_none());
        assert!(EncoderConfiguration::parse_spec("mosaic=wide").is_none());
    }
}
