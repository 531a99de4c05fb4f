//! SDP offer structure produced by the str0m transport.
//!
//! Requires the `webrtc` feature (pulls in `str0m` and `audiopus`).
//! Run: `cargo test -p callkit-realtime --features webrtc --test sdp_offer_tests`

#![cfg(feature = "webrtc")]

use std::net::SocketAddr;
use std::sync::Arc;

use callkit_realtime::webrtc::Str0mTransportFactory;
use callkit_realtime::{
    AudioTrack, CallError, PeerTransport, RemoteAudio, RemoteTrackHandler, SdpType, SessionDescription,
    TransportConfig, TransportFactory,
};
use proptest::prelude::*;

fn loopback_factory() -> Str0mTransportFactory {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Str0mTransportFactory::new().with_bind_addr(addr)
}

fn ignore_remote() -> RemoteTrackHandler {
    Arc::new(|_: RemoteAudio| {})
}

async fn transport() -> Arc<dyn PeerTransport> {
    loopback_factory()
        .create(&TransportConfig::new(vec!["stun:127.0.0.1:3478".into()]), ignore_remote())
        .await
        .expect("transport should bind on loopback")
}

#[tokio::test]
async fn test_offer_has_audio_and_data_channel() {
    let transport = transport().await;
    transport.add_track(AudioTrack::new("mic", 48_000)).unwrap();
    transport.add_recv_only_audio().unwrap();
    let _channel = transport.create_side_channel("oai-events").unwrap();

    let offer = transport.create_offer().await.unwrap();
    assert_eq!(offer.sdp_type, SdpType::Offer);
    assert!(offer.sdp.starts_with("v=0"));
    assert_eq!(offer.sdp.matches("m=audio").count(), 1);
    assert!(offer.sdp.contains("a=sendrecv"));
    assert!(offer.sdp.to_lowercase().contains("opus/48000"));
    assert!(offer.sdp.contains("m=application"));
    assert!(offer.sdp.contains("a=candidate"));
    assert!(offer.sdp.contains("127.0.0.1"));

    transport.set_local_description(offer).await.unwrap();
    transport.close();
}

#[tokio::test]
async fn test_receive_only_without_local_track() {
    let transport = transport().await;
    transport.add_recv_only_audio().unwrap();
    let _channel = transport.create_side_channel("oai-events").unwrap();

    let offer = transport.create_offer().await.unwrap();
    assert!(offer.sdp.contains("m=audio"));
    assert!(offer.sdp.contains("a=recvonly"));
}

#[tokio::test]
async fn test_rejects_foreign_local_description() {
    let transport = transport().await;
    transport.add_recv_only_audio().unwrap();
    transport.create_offer().await.unwrap();

    let err = transport
        .set_local_description(SessionDescription::offer("v=0\r\n"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Transport(_)));
}

#[tokio::test]
async fn test_answer_requires_committed_offer() {
    let transport = transport().await;
    transport.add_recv_only_audio().unwrap();
    transport.create_offer().await.unwrap();

    let err = transport
        .set_remote_description(SessionDescription::answer("v=0\r\n"))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::transport("local description not set"));
}

#[tokio::test]
async fn test_unsupported_track_rate_is_rejected() {
    let transport = transport().await;
    let err = transport.add_track(AudioTrack::new("mic", 44_100)).unwrap_err();
    assert!(matches!(err, CallError::AudioFormat(_)));
}

#[tokio::test]
async fn test_closed_transport_refuses_setup() {
    let transport = transport().await;
    transport.close();
    transport.close();
    assert!(transport.is_closed());
    assert!(transport.add_recv_only_audio().is_err());
    assert!(transport.create_side_channel("oai-events").is_err());
}

fn arb_label() -> impl Strategy<Value = String> {
    prop_oneof![Just("oai-events".to_string()), "[a-z][a-z0-9-]{0,15}"]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Any side-channel label yields exactly one audio line and one data section.
    #[test]
    fn prop_offer_structure(label in arb_label(), with_track in any::<bool>()) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let sdp = rt.block_on(async {
            let transport = transport().await;
            if with_track {
                transport.add_track(AudioTrack::new("mic", 48_000)).unwrap();
            }
            transport.add_recv_only_audio().unwrap();
            let _channel = transport.create_side_channel(&label).unwrap();
            transport.create_offer().await.unwrap().sdp
        });

        prop_assert_eq!(sdp.matches("m=audio").count(), 1);
        prop_assert_eq!(sdp.matches("m=application").count(), 1);
        let direction = if with_track { "a=sendrecv" } else { "a=recvonly" };
        prop_assert!(sdp.contains(direction), "missing {} in offer", direction);
    }
}
