//! ICE server and signaling URL derivation

use crate::identity::PeerId;
use crate::types::ServerParams;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN fallback offered alongside TURN
pub const STUN_PRIMARY: &str = "stun:stun1.l.google.com:19302";

/// Second public STUN server offered when TURN is disabled
pub const STUN_SECONDARY: &str = "stun:stun2.l.google.com:19302";

/// Derive the ICE servers offered to both media transports.
///
/// With TURN enabled every TURN port yields a TLS-over-UDP entry (unless
/// `force_tcp`) and a TLS-over-TCP entry, followed by one STUN fallback.
/// Without TURN two public STUN servers are offered.
#[must_use]
pub fn ice_servers(params: &ServerParams, force_tcp: bool) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();

    match params.turn.as_ref().filter(|turn| turn.enabled) {
        Some(turn) => {
            for transport in &turn.transports {
                if !force_tcp {
                    servers.push(RTCIceServer {
                        urls: vec![format!("turns:{}:{}", params.host, transport.port)],
                        username: turn.username.clone(),
                        credential: turn.credential.clone(),
                        ..Default::default()
                    });
                }
                servers.push(RTCIceServer {
                    urls: vec![format!(
                        "turns:{}:{}?transport=tcp",
                        params.host, transport.port
                    )],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                });
            }
            servers.push(stun(STUN_PRIMARY));
        }
        None => {
            servers.push(stun(STUN_PRIMARY));
            servers.push(stun(STUN_SECONDARY));
        }
    }

    servers
}

fn stun(url: &str) -> RTCIceServer {
    RTCIceServer {
        urls: vec![url.to_string()],
        ..Default::default()
    }
}

/// Signaling URL carrying the room and participant as query parameters
///
/// # Errors
///
/// Returns error if `server_url` is not a valid URL
pub fn signaling_url(server_url: &str, room_id: &str, peer: &PeerId) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(server_url)?;
    url.query_pairs_mut()
        .append_pair("roomId", room_id)
        .append_pair("peerId", peer.as_str());
    Ok(url)
}
