//! Session-description parsing for DESCRIBE responses.
//!
//! Only the parts needed to locate faces are read: `m=video` opens a media block,
//! any other `m=` closes it, and inside a video block the `a=` attributes
//! `x-pelco-video-layout` and `control` are collected. A stream is emitted as soon as
//! a block has produced both a layout and an endpoint; the rest of that block is
//! skipped. Everything else is ignored.

use url::Url;

/// Attribute carrying the opaque per-face layout metadata.
pub const LAYOUT_ATTRIBUTE: &str = "x-pelco-video-layout";

/// Where the DESCRIBE was sent, needed to resolve relative control values.
#[derive(Clone, Copy, Debug)]
pub struct DescribeContext<'a> {
    pub host: &'a str,
    pub request_url: &'a str,
    /// Single-stream devices: every video block maps to the request URL itself.
    pub unistream: bool,
}

/// One video block that resolved to a face endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdpStream {
    pub endpoint: String,
    /// Terminal path, matched against encoder configuration names.
    pub path: String,
    pub layout_metadata: String,
}

pub fn parse_streams(body: &str, ctx: &DescribeContext<'_>) -> Vec<SdpStream> {
    let mut streams = Vec::new();
    let mut in_video = false;
    let mut layout: Option<String> = None;
    let mut endpoint: Option<(String, String)> = None;

    for raw in body.lines() {
        let line = raw.trim_end_matches('\r');
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        if key == "m" {
            in_video = value.starts_with("video");
            layout = None;
            endpoint = None;
            continue;
        }
        if !in_video || key != "a" {
            continue;
        }

        let Some((attribute, attribute_value)) = value.split_once(':') else {
            continue;
        };
        if attribute == LAYOUT_ATTRIBUTE {
            layout = Some(attribute_value.to_string());
        } else if ctx.unistream {
            endpoint = Some((
                ctx.request_url.to_string(),
                last_segment(ctx.request_url).to_string(),
            ));
        } else if attribute == "control" {
            endpoint = Some(resolve_control(attribute_value, ctx.host));
        }

        if let (Some(layout_metadata), Some((url, path))) = (&layout, &endpoint) {
            streams.push(SdpStream {
                endpoint: url.clone(),
                path: path.clone(),
                layout_metadata: layout_metadata.clone(),
            });
            in_video = false;
            layout = None;
            endpoint = None;
        }
    }
    streams
}

/// Turn a `control` value into `(endpoint, path)`.
///
/// - `video` is the combined mosaic stream
/// - `<name>_video...` is truncated to `<name>_v`
/// - absolute URLs are used as-is
/// - anything else is a path on the camera
pub fn resolve_control(value: &str, host: &str) -> (String, String) {
    if value == "video" {
        return (format!("rtsp://{host}/mosaic"), "mosaic".to_string());
    }
    if let Some(pos) = value.find("_video") {
        let path = &value[..pos + 2];
        let path = path.rsplit('/').next().unwrap_or(path);
        return (format!("rtsp://{host}/{path}"), path.to_string());
    }
    if let Ok(url) = Url::parse(value) {
        if url.has_host() {
            let path = url
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .unwrap_or_default()
                .to_string();
            return (value.to_string(), path);
        }
    }
    let path = value.trim_start_matches('/');
    (format!("rtsp://{host}/{path}"), path.to_string())
}

fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI_FACE: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.5\r\n\
s=Immersive\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=x-pelco-video-layout:front:0,0,864,2680\r\n\
a=control:front_video\r\n\
m=audio 0 RTP/AVP 0\r\n\
a=control:audio\r\n\
a=x-pelco-video-layout:bogus\r\n\
m=video 0 RTP/AVP 97\r\n\
a=control:left_video2\r\n\
a=x-pelco-video-layout:left:0,0,864,2680\r\n\
a=framerate:30\r\n";

    fn ctx(unistream: bool) -> DescribeContext<'static> {
        DescribeContext {
            host: "10.0.0.5",
            request_url: "rtsp://10.0.0.5/unistream_v",
            unistream,
        }
    }

    #[test]
    fn emits_one_stream_per_video_block() {
        let streams = parse_streams(MULTI_FACE, &ctx(false));
        assert_eq!(
            streams,
            vec![
                SdpStream {
                    endpoint: "rtsp://10.0.0.5/front_v".to_string(),
                    path: "front_v".to_string(),
                    layout_metadata: "front:0,0,864,2680".to_string(),
                },
                SdpStream {
                    endpoint: "rtsp://10.0.0.5/left_v".to_string(),
                    path: "left_v".to_string(),
                    layout_metadata: "left:0,0,864,2680".to_string(),
                },
            ]
        );
    }

    #[test]
    fn blocks_missing_a_piece_are_dropped() {
        let body = "m=video 0 RTP/AVP 96\na=control:video\nm=video 0 RTP/AVP 97\na=x-pelco-video-layout:x\n";
        assert!(parse_streams(body, &ctx(false)).is_empty());
    }

    #[test]
    fn attributes_before_any_video_block_are_ignored() {
        let body = "a=x-pelco-video-layout:x\na=control:video\n";
        assert!(parse_streams(body, &ctx(false)).is_empty());
    }

    #[test]
    fn unistream_uses_request_url() {
        let body = "m=video 0 RTP/AVP 96\na=x-pelco-video-layout:uni\na=control:trackID=1\n";
        let streams = parse_streams(body, &ctx(true));
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].endpoint, "rtsp://10.0.0.5/unistream_v");
        assert_eq!(streams[0].path, "unistream_v");
    }

    #[test]
    fn control_resolution_rules() {
        assert_eq!(
            resolve_control("video", "cam"),
            ("rtsp://cam/mosaic".to_string(), "mosaic".to_string())
        );
        assert_eq!(
            resolve_control("back_video_hd", "cam"),
            ("rtsp://cam/back_v".to_string(), "back_v".to_string())
        );
        assert_eq!(
            resolve_control("rtsp://cam:8554/streams/up", "cam"),
            ("rtsp://cam:8554/streams/up".to_string(), "up".to_string())
        );
        assert_eq!(
            resolve_control("/right", "cam"),
            ("rtsp://cam/right".to_string(), "right".to_string())
        );
    }
}
