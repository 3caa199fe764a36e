use std::fmt::Display;
use std::io;
use std::net::UdpSocket;

/// `SB_TEST_REQUIRE_NET=1` turns every skip into a hard failure.
fn strict() -> bool {
    std::env::var("SB_TEST_REQUIRE_NET")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// 打印跳过原因；严格模式下返回 false 让调用方继续并失败。
pub fn skip_with_reason(context: &str, reason: impl Display) -> bool {
    if strict() {
        return false;
    }
    eprintln!("skipping {context}: {reason}");
    true
}

/// Skip when a bind fails because the sandbox forbids the socket type.
pub fn skip_if_io_permission_denied(err: &io::Error, context: &str) -> bool {
    match err.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::AddrNotAvailable => {
            skip_with_reason(context, err)
        }
        _ => false,
    }
}

/// Probe loopback UDP before a QUIC test; returns true when it should be skipped.
pub fn skip_if_udp_unavailable(context: &str) -> bool {
    match UdpSocket::bind("127.0.0.1:0") {
        Ok(_) => false,
        Err(e) => skip_with_reason(context, e),
    }
}
