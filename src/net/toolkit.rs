//! Stream transports: protocol enumeration, pipeline description tables and
//! host address helpers
//!
//! The selection matrix is contractual: a consumer on the same host gets RAW
//! RGB over UDP, a consumer flagging low bandwidth gets H264 over RTP/UDP,
//! everyone else gets JPEG over RTP/UDP.

use std::net::UdpSocket;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Wire transport of a negotiated peer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamProtocol {
    UdpRaw = 0,
    UdpJpeg = 1,
    UdpH264 = 2,
    ShmRaw = 3,
}

impl StreamProtocol {
    pub fn from_i32(v: i32) -> Option<StreamProtocol> {
        match v {
            0 => Some(StreamProtocol::UdpRaw),
            1 => Some(StreamProtocol::UdpJpeg),
            2 => Some(StreamProtocol::UdpH264),
            3 => Some(StreamProtocol::ShmRaw),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StreamProtocol::UdpRaw => "RAW Images",
            StreamProtocol::UdpJpeg => "JPEG Stream",
            StreamProtocol::UdpH264 => "H264 Stream",
            StreamProtocol::ShmRaw => "RGB Shared Memory",
        }
    }
}

/// Chooses the transport offered to a stream consumer.
pub fn select_transport(client_address: &str, low_bandwidth: bool) -> StreamProtocol {
    if is_host_ip(client_address) {
        StreamProtocol::UdpRaw
    } else if low_bandwidth {
        StreamProtocol::UdpH264
    } else {
        StreamProtocol::UdpJpeg
    }
}

/// Sender half of a peer stream, to be prefixed with an appsrc stage
pub fn send_pipeline(protocol: StreamProtocol, host: &str, port: u16) -> String {
    match protocol {
        StreamProtocol::UdpRaw => format!(
            "video/x-raw,format=RGB,framerate=30/1 ! queue max-size-buffers=10 ! \
             rtpvrawpay ! application/x-rtp,sampling=RGB ! udpsink name=sink host={} port={}",
            host, port
        ),
        StreamProtocol::UdpJpeg => format!(
            "videoconvert ! video/x-raw,format=I420,framerate=30/1 ! queue max-size-buffers=10 ! \
             jpegenc quality=85 ! rtpjpegpay ! udpsink name=sink host={} port={}",
            host, port
        ),
        StreamProtocol::UdpH264 => format!(
            "videoconvert ! video/x-raw,format=NV12,framerate=30/1 ! queue max-size-buffers=10 ! \
             x264enc tune=zerolatency pass=4 quantizer=22 speed-preset=2 ! \
             rtph264pay aggregate-mode=1 ! udpsink name=sink host={} port={}",
            host, port
        ),
        StreamProtocol::ShmRaw => format!(
            "video/x-raw,format=RGB,framerate=30/1 ! queue max-size-buffers=10 ! \
             shmsink name=sink buffer-time=100000 wait-for-connection=true socket-path={}",
            host
        ),
    }
}

/// Receiver half of a peer stream, decoding to raw video
pub fn receive_pipeline(protocol: StreamProtocol, port: u16, width: u32, height: u32) -> String {
    match protocol {
        StreamProtocol::UdpRaw => format!(
            "udpsrc port={} caps=\"application/x-rtp,media=(string)video,\
             encoding-name=(string)RAW,sampling=(string)RGB,depth=(string)8,\
             width=(string){},height=(string){}\" ! rtpvrawdepay ! queue max-size-buffers=10",
            port, width, height
        ),
        StreamProtocol::UdpJpeg => format!(
            "udpsrc port={} caps=\"application/x-rtp,media=(string)video,\
             encoding-name=(string)JPEG\" ! rtpjpegdepay ! decodebin",
            port
        ),
        StreamProtocol::UdpH264 => format!(
            "udpsrc port={} caps=\"application/x-rtp,media=(string)video,\
             encoding-name=(string)H264\" ! rtph264depay ! decodebin",
            port
        ),
        StreamProtocol::ShmRaw => format!(
            "shmsrc is-live=true socket-path=/tmp/shm_socket_{} ! \
             video/x-raw,format=RGB,framerate=30/1,width={},height={} ! queue max-size-buffers=10",
            port, width, height
        ),
    }
}

/// SRT broadcast sink listening on a port
pub fn srt_sink_pipeline(port: u16) -> String {
    format!(
        "videoconvert ! video/x-raw,format=NV12 ! x264enc tune=zerolatency speed-preset=3 ! \
         h264parse ! mpegtsmux ! srtsink name=sink uri=srt://:{}?mode=listener wait-for-connection=false",
        port
    )
}

/// Shared-memory writer sink
pub fn shm_sink_pipeline(socket_path: &str) -> String {
    format!(
        "video/x-raw,format=RGB,framerate=30/1 ! queue max-size-buffers=10 ! \
         shmsink name=sink buffer-time=100000 wait-for-connection=true socket-path={}",
        socket_path
    )
}

/// Virtual camera (v4l2 loopback) writer sink
pub fn loopback_sink_pipeline(device_index: u32) -> String {
    format!(
        "videoconvert ! video/x-raw,format=YUY2 ! v4l2sink name=sink device=/dev/video{}",
        device_index
    )
}

static LOCAL_IP: Lazy<Option<String>> = Lazy::new(detect_local_ip);

/// Attempts to get the local IP address by connecting a UDP socket outward.
fn detect_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Addresses under which this host is reachable
pub fn host_ips() -> Vec<String> {
    let mut ips = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    if let Some(ip) = LOCAL_IP.as_ref() {
        ips.push(ip.clone());
    }
    ips
}

/// True when `ip` designates this very host
pub fn is_host_ip(ip: &str) -> bool {
    host_ips().iter().any(|h| h == ip)
}

/// Short host name used in the instance name advertised to peers
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_matrix_is_contractual() {
        assert_eq!(select_transport("127.0.0.1", false), StreamProtocol::UdpRaw);
        assert_eq!(select_transport("localhost", true), StreamProtocol::UdpRaw);
        assert_eq!(select_transport("192.0.2.1", true), StreamProtocol::UdpH264);
        assert_eq!(select_transport("192.0.2.1", false), StreamProtocol::UdpJpeg);
    }

    #[test]
    fn protocol_round_trip() {
        for p in [
            StreamProtocol::UdpRaw,
            StreamProtocol::UdpJpeg,
            StreamProtocol::UdpH264,
            StreamProtocol::ShmRaw,
        ] {
            assert_eq!(StreamProtocol::from_i32(p as i32), Some(p));
        }
        assert_eq!(StreamProtocol::from_i32(42), None);
    }

    #[test]
    fn pipelines_name_their_sink() {
        for p in [StreamProtocol::UdpRaw, StreamProtocol::UdpJpeg, StreamProtocol::UdpH264] {
            assert!(send_pipeline(p, "10.0.0.2", 5000).contains("name=sink"));
        }
        assert!(srt_sink_pipeline(7200).contains("srt://:7200"));
        assert!(loopback_sink_pipeline(4).contains("/dev/video4"));
    }
}
