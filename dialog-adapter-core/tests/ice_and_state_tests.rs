//! ICE server derivation and session state machine tests

use dialog_adapter_core::ice::{ice_servers, signaling_url, STUN_PRIMARY, STUN_SECONDARY};
use dialog_adapter_core::{
    ConnectParams, IcePolicy, PeerId, ServerParams, SessionConfig, SessionState, TransportConfig,
    TurnConfig, TurnTransport,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn params(turn: Option<TurnConfig>) -> ServerParams {
    ServerParams {
        host: "media.example.com".to_string(),
        port: 4443,
        turn,
    }
}

fn turn(ports: &[u16], enabled: bool) -> TurnConfig {
    TurnConfig {
        enabled,
        username: "user".to_string(),
        credential: "secret".to_string(),
        transports: ports.iter().map(|port| TurnTransport { port: *port }).collect(),
    }
}

#[test]
fn turn_ports_become_tls_entries_then_stun() {
    let servers = ice_servers(&params(Some(turn(&[443], true))), false);
    let urls: Vec<&str> = servers.iter().map(|s| s.urls[0].as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "turns:media.example.com:443",
            "turns:media.example.com:443?transport=tcp",
            STUN_PRIMARY,
        ]
    );
    assert_eq!(servers[0].username, "user");
    assert_eq!(servers[1].credential, "secret");
    assert!(servers[2].username.is_empty());
}

#[test]
fn force_tcp_drops_udp_turn_entries() {
    let servers = ice_servers(&params(Some(turn(&[443, 5349], true))), true);
    assert_eq!(servers.len(), 3);
    assert!(servers[..2]
        .iter()
        .all(|s| s.urls[0].ends_with("?transport=tcp")));
}

#[test]
fn disabled_turn_offers_two_stun_servers() {
    let servers = ice_servers(&params(Some(turn(&[443], false))), false);
    let urls: Vec<&str> = servers.iter().map(|s| s.urls[0].as_str()).collect();
    assert_eq!(urls, vec![STUN_PRIMARY, STUN_SECONDARY]);
    assert_eq!(ice_servers(&params(None), true).len(), 2);
}

#[test]
fn transport_config_follows_session_config() {
    let config = SessionConfig {
        force_turn: true,
        force_tcp: true,
        ..SessionConfig::default()
    };
    let transport = TransportConfig::for_host(&params(Some(turn(&[443], true))), &config);
    assert_eq!(transport.ice_transport_policy, IcePolicy::Relay);
    assert_eq!(transport.ice_servers.len(), 2);
}

#[test]
fn signaling_url_carries_room_and_peer() {
    let connect = ConnectParams::for_host("room 7", PeerId::new("alice"), params(None));
    assert_eq!(connect.server_url, "wss://media.example.com:4443");

    let url = signaling_url(&connect.server_url, &connect.room_id, &connect.client_id).unwrap();
    assert_eq!(url.host_str(), Some("media.example.com"));
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert_eq!(
        query,
        vec![
            ("roomId".to_string(), "room 7".to_string()),
            ("peerId".to_string(), "alice".to_string()),
        ]
    );
    assert!(signaling_url("not a url", "room", &PeerId::new("a")).is_err());
}

#[test]
fn session_config_defaults_and_partial_json() {
    let config: SessionConfig = serde_json::from_str(r#"{ "force_tcp": true }"#).unwrap();
    assert!(config.force_tcp);
    assert_eq!(config.signaling_retries, 2);
    assert_eq!(config.event_capacity, 256);
    assert_eq!(config.effective_ice_policy(), IcePolicy::All);
}

#[test]
fn failed_session_can_reconnect_but_not_rejoin() {
    assert!(SessionState::Failed.can_transition_to(SessionState::Connecting));
    assert!(!SessionState::Failed.can_transition_to(SessionState::Joining));
    assert!(!SessionState::Connecting.can_transition_to(SessionState::Joined));
    assert!(SessionState::Degraded.is_joined());
    assert!(!SessionState::Joining.is_joined());
}

fn any_state() -> impl Strategy<Value = SessionState> {
    prop_oneof![
        Just(SessionState::Disconnected),
        Just(SessionState::Connecting),
        Just(SessionState::Joining),
        Just(SessionState::Joined),
        Just(SessionState::Degraded),
        Just(SessionState::Failed),
    ]
}

proptest! {
    #[test]
    fn ice_server_count_matches_turn_ports(
        ports in proptest::collection::vec(1u16..=65535, 0..6),
        enabled in any::<bool>(),
        force_tcp in any::<bool>(),
    ) {
        let servers = ice_servers(&params(Some(turn(&ports, enabled))), force_tcp);
        let expected = match (enabled, force_tcp) {
            (false, _) => 2,
            (true, false) => 2 * ports.len() + 1,
            (true, true) => ports.len() + 1,
        };
        prop_assert_eq!(servers.len(), expected);
    }

    #[test]
    fn every_state_can_disconnect_except_disconnected(state in any_state()) {
        prop_assert_eq!(
            state.can_transition_to(SessionState::Disconnected),
            state != SessionState::Disconnected
        );
        prop_assert!(!state.can_transition_to(state));
    }
}
