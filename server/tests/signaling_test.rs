//! Signaling integration tests.
//!
//! Drive the signaling service the way WebSocket clients would and check
//! room membership, announcements and teardown end to end.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{audio_parameters, service, service_with, video_parameters, TestPeer};
use vc_common::ortc::rtc_codec_capability;
use vc_common::protocol::{
    ClientRequest, ConnectTransport, ConsumerRef, ErrorCode, ProducerRef, RoomRef,
    ServerNotification, SetMediaState, SetScreenShareQuality,
};
use vc_common::{
    CallEndReason, DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters, IceState, MediaKind,
    Quality, RoomId, RtpCapabilities, TrackSource, TransportDirection,
};
use vc_sfu::config::Config;
use vc_sfu::voice::{VoiceError, SESSION_CHANNEL_CAPACITY};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

fn packet(seq: u16, payload_type: u8, ssrc: u32) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type,
            sequence_number: seq,
            ssrc,
            ..Header::default()
        },
        payload: bytes::Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
    }
}

fn count<F>(notifications: &[ServerNotification], f: F) -> usize
where
    F: Fn(&ServerNotification) -> bool,
{
    notifications.iter().filter(|n| f(n)).count()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_publish_then_subscribe_forwards_audio() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;

    alice.join_ready("room-1").await;
    let router = service
        .registry()
        .get_router(&RoomId::from("room-1"))
        .expect("router created on first join");
    let p1 = alice.produce_audio().await;

    let joined = bob.join_ready("room-1").await;
    assert_eq!(
        service.registry().get_router(&RoomId::from("room-1")).unwrap().id(),
        router.id(),
        "second join reuses the router"
    );
    assert_eq!(joined.peers.len(), 1);
    assert_eq!(joined.peers[0].peer_id, alice.peer_id());
    let announced = joined
        .producers
        .iter()
        .find(|p| p.producer_id == p1)
        .expect("existing producer listed on join");
    assert_eq!(announced.peer_id, alice.peer_id());
    assert_eq!(announced.kind, MediaKind::Audio);

    let consumer = bob.consume(p1).await.unwrap();
    assert_eq!(consumer.producer_id, p1);
    assert_eq!(consumer.peer_id, alice.peer_id());
    assert_eq!(consumer.source, TrackSource::Microphone);

    let engine_consumer = router.consumer(consumer.id).unwrap();
    assert!(engine_consumer.is_paused(), "consumers start paused");
    let consumer_codec = consumer.rtp_parameters.codec().unwrap().clone();
    let incoming = bob
        .recv_stack
        .as_ref()
        .unwrap()
        .receive(
            MediaKind::Audio,
            &consumer_codec,
            consumer.rtp_parameters.ssrc().unwrap(),
        )
        .await
        .unwrap();

    bob.request(ClientRequest::ResumeConsumer(ConsumerRef {
        room_id: bob.room_id(),
        consumer_id: consumer.id,
    }))
    .await
    .unwrap();

    // alice's microphone over her send transport
    let publish_codec = audio_parameters(1111).codecs[0].clone();
    let mic = Arc::new(TrackLocalStaticRTP::new(
        rtc_codec_capability(&publish_codec),
        "mic".into(),
        "alice".into(),
    ));
    let _sender = alice
        .send_stack
        .as_ref()
        .unwrap()
        .send(MediaKind::Audio, mic.clone(), &publish_codec, 1111)
        .await
        .unwrap();
    let pump = tokio::spawn(async move {
        for seq in 1..=u16::MAX {
            let _ = mic.write_rtp(&packet(seq, 100, 1111)).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let track = incoming.track();
    let mut buf = vec![0u8; 1500];
    let (forwarded, _) = tokio::time::timeout(Duration::from_secs(5), track.read(&mut buf))
        .await
        .expect("no packet reached bob")
        .unwrap();
    pump.abort();
    assert_eq!(
        forwarded.header.payload_type,
        consumer.rtp_parameters.codec().unwrap().payload_type
    );
    assert_eq!(&forwarded.payload[..], &[0xde, 0xad, 0xbe, 0xef]);

    // alice heard about bob
    let events = alice.drain();
    assert_eq!(
        count(&events, |n| matches!(n, ServerNotification::PeerJoined(p) if p.peer_id == bob.peer_id())),
        1
    );
}

#[tokio::test]
async fn test_disconnect_closes_remote_consumers() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;

    alice.join_ready("room-1").await;
    let p1 = alice.produce_audio().await;
    bob.join_ready("room-1").await;
    let c1 = bob.consume(p1).await.unwrap().id;
    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    bob.drain();

    service.disconnect(&alice.session).await;

    let events = bob.drain();
    assert_eq!(
        count(&events, |n| matches!(n, ServerNotification::ConsumerClosed { consumer_id, .. } if *consumer_id == c1)),
        1
    );
    assert_eq!(
        count(&events, |n| matches!(n, ServerNotification::ProducerClosed { producer_id, .. } if *producer_id == p1)),
        1
    );
    assert_eq!(
        count(&events, |n| matches!(n, ServerNotification::PeerLeft { peer_id, .. } if *peer_id == alice.peer_id())),
        1
    );
    assert!(router.consumer(c1).is_none());
    assert!(router.producer(p1).is_none());
    assert!(!service.sessions().is_connected(alice.peer_id()));
}

#[tokio::test]
async fn test_screen_share_quality_change_keeps_producer() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    bob.join_ready("room-1").await;

    let screen = alice
        .produce(
            TrackSource::ScreenVideo,
            video_parameters(2222),
            Some(Quality::Medium),
        )
        .await
        .unwrap();
    bob.drain();

    alice
        .request(ClientRequest::SetScreenShareQuality(SetScreenShareQuality {
            room_id: alice.room_id(),
            producer_id: screen,
            quality: Quality::High,
        }))
        .await
        .unwrap();

    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    let producer = router.producer(screen).expect("same producer id");
    assert_eq!(producer.quality(), Some(Quality::High));
    let params = producer.rtp_parameters();
    assert_eq!(params.encodings[0].max_bitrate, Some(Quality::High.max_bitrate()));
    assert_eq!(params.encodings[0].max_framerate, Some(Quality::High.max_fps()));
    assert_eq!(router.producers().len(), 1);

    let events = bob.drain();
    assert!(events.iter().any(|n| matches!(
        n,
        ServerNotification::ScreenShareQualityChanged { producer_id, quality: Quality::High, .. }
            if *producer_id == screen
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_joins_create_one_router() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;

    let (a, b) = tokio::join!(alice.try_join("room-5"), bob.try_join("room-5"));
    a.unwrap();
    b.unwrap();

    assert_eq!(service.registry().created_count(), 1);
    assert_eq!(service.registry().len(), 1);
    let room = service.room(&RoomId::from("room-5")).unwrap();
    assert_eq!(room.peer_count().await, 2);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_ice_failure_closes_transport_and_dependents() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    let mic = alice.produce_audio().await;
    let camera = alice
        .produce(TrackSource::Camera, video_parameters(3333), None)
        .await
        .unwrap();
    bob.join_ready("room-1").await;
    let c_mic = bob.consume(mic).await.unwrap().id;
    let c_cam = bob.consume(camera).await.unwrap().id;
    alice.drain();
    bob.drain();

    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    let send = alice.send_transport.unwrap();
    let report = router.handle_ice_state(send, IceState::Failed);
    assert_eq!(report.producers.len(), 2);
    assert_eq!(report.consumers.len(), 2);

    match alice.next_notification().await {
        ServerNotification::TransportClosed { transport_id, .. } => assert_eq!(transport_id, send),
        other => panic!("expected transport-closed, got {other:?}"),
    }

    // producer-closed follows the owner's bookkeeping, so wait for both
    let mut closed_consumers = Vec::new();
    let mut closed_producers = 0;
    while closed_consumers.len() < 2 || closed_producers < 2 {
        match bob.next_notification().await {
            ServerNotification::ConsumerClosed { consumer_id, .. } => {
                closed_consumers.push(consumer_id);
            }
            ServerNotification::ProducerClosed { .. } => closed_producers += 1,
            _ => {}
        }
    }
    assert!(closed_consumers.contains(&c_mic));
    assert!(closed_consumers.contains(&c_cam));

    assert!(router.producer(mic).is_none());
    assert!(router.producer(camera).is_none());
    assert!(router.consumers_of(mic).is_empty());
    assert!(router.consumers_of(camera).is_empty());
    assert!(
        router
            .producers()
            .iter()
            .all(|p| !p.is_closed()),
        "no closed producer left in the router"
    );

    // alice may reopen a send transport after the failure
    alice.open_transport(TransportDirection::Send).await;
    alice.produce_audio().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_producer_announced_exactly_once() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;

    // produce races bob's join
    let (produced, joined) = tokio::join!(alice.produce_audio(), bob.try_join("room-1"));
    let joined = joined.unwrap();

    let listed = joined
        .producers
        .iter()
        .filter(|p| p.producer_id == produced)
        .count();
    let announced = count(&bob.drain(), |n| {
        matches!(n, ServerNotification::NewProducer(p) if p.producer_id == produced)
    });
    assert_eq!(listed + announced, 1);

    // a producer published after the join is announced
    bob.register_capabilities().await;
    bob.open_transport(TransportDirection::Recv).await;
    let camera = alice
        .produce(TrackSource::Camera, video_parameters(4444), None)
        .await
        .unwrap();
    let announced = count(&bob.drain(), |n| {
        matches!(n, ServerNotification::NewProducer(p) if p.producer_id == camera)
    });
    assert_eq!(announced, 1);

    // at most one consumer per producer
    let first = bob.consume(camera).await.unwrap();
    let second = bob.consume(camera).await.unwrap();
    assert_eq!(first.id, second.id);
    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    assert_eq!(router.consumers_of(camera).len(), 1);
}

#[tokio::test]
async fn test_consume_requires_registered_capabilities() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    let p1 = alice.produce_audio().await;

    bob.join("room-1").await;
    bob.open_transport(TransportDirection::Recv).await;
    assert!(matches!(
        bob.consume(p1).await,
        Err(VoiceError::CapabilitiesNotRegistered)
    ));
    // inline capabilities do not stand in for registration
    assert!(matches!(
        bob.consume_with(p1, Some(vc_sfu::engine::Router::media_codecs()))
            .await,
        Err(VoiceError::CapabilitiesNotRegistered)
    ));
    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    assert!(router.consumers_of(p1).is_empty());

    bob.register_capabilities().await;
    // inline capabilities can only narrow what was registered
    assert!(matches!(
        bob.consume_with(p1, Some(RtpCapabilities::default())).await,
        Err(VoiceError::Consume { .. })
    ));
    let consumer = bob.consume(p1).await.unwrap();
    assert!(!consumer.producer_paused);
    assert!(router.consumer(consumer.id).unwrap().is_paused());
}

#[tokio::test]
async fn test_pause_resume_preserves_producer_id() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    let mic = alice.produce_audio().await;
    bob.join_ready("room-1").await;
    let consumer = bob.consume(mic).await.unwrap();
    bob.drain();

    let producer_ref = ProducerRef {
        room_id: alice.room_id(),
        producer_id: mic,
    };
    alice
        .request(ClientRequest::PauseProducer(producer_ref.clone()))
        .await
        .unwrap();

    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    assert!(router.producer(mic).unwrap().is_paused());
    assert!(router.consumer(consumer.id).unwrap().is_producer_paused());

    let events = bob.drain();
    assert_eq!(
        count(&events, |n| matches!(n, ServerNotification::ProducerPaused { producer_id, .. } if *producer_id == mic)),
        1
    );
    assert!(events.iter().any(|n| matches!(
        n,
        ServerNotification::PeerMediaState { state, .. } if state.muted
    )));

    alice
        .request(ClientRequest::ResumeProducer(producer_ref))
        .await
        .unwrap();
    let producer = router.producer(mic).unwrap();
    assert_eq!(producer.id(), mic);
    assert!(!producer.is_paused());
    assert_eq!(router.producers().len(), 1, "no new produce");
    assert!(bob.drain().iter().any(|n| matches!(
        n,
        ServerNotification::ProducerResumed { producer_id, .. } if *producer_id == mic
    )));
}

#[tokio::test]
async fn test_leave_broadcasts_one_peer_left() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    let mut carol = TestPeer::connect(&service, "carol").await;
    alice.join("room-1").await;
    bob.join("room-1").await;
    carol.join("room-1").await;
    bob.drain();
    carol.drain();

    alice
        .request(ClientRequest::LeaveRoom(RoomRef {
            room_id: RoomId::from("room-1"),
        }))
        .await
        .unwrap();
    // a second leave is rejected rather than broadcast again
    assert!(matches!(
        alice
            .request(ClientRequest::LeaveRoom(RoomRef {
                room_id: RoomId::from("room-1"),
            }))
            .await,
        Err(VoiceError::NotInRoom(_))
    ));
    service.disconnect(&alice.session).await;

    for peer in [&mut bob, &mut carol] {
        let events = peer.drain();
        assert_eq!(
            count(&events, |n| matches!(n, ServerNotification::PeerLeft { peer_id, .. } if *peer_id == alice.peer_id())),
            1
        );
    }
    let room = service.room(&RoomId::from("room-1")).unwrap();
    assert!(room.get_peer(alice.peer_id()).await.is_none());
    assert_eq!(room.peer_count().await, 2);
}

// ============================================================================
// Room lifecycle and failures
// ============================================================================

#[tokio::test]
async fn test_empty_room_releases_router() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    alice.join("room-1").await;
    let first = service.registry().get_router(&RoomId::from("room-1")).unwrap();

    service.disconnect(&alice.session).await;
    assert!(first.is_closed());
    assert!(service.room(&RoomId::from("room-1")).is_none());
    assert!(service.registry().is_empty());

    let mut bob = TestPeer::connect(&service, "bob").await;
    bob.join("room-1").await;
    let second = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(service.registry().created_count(), 2);
}

#[tokio::test]
async fn test_room_capacity_and_double_join() {
    let service = service_with(Config {
        max_peers_per_room: 1,
        ..Config::default_for_test()
    })
    .await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join("room-1").await;

    assert!(matches!(
        alice.try_join("room-2").await,
        Err(VoiceError::AlreadyJoined(_))
    ));
    assert!(matches!(
        bob.try_join("room-1").await,
        Err(VoiceError::RoomFull { max_peers: 1 })
    ));
    // the failed join left nothing behind
    assert!(bob.session.membership().is_none());
    assert!(service.room(&RoomId::from("room-2")).is_none());
}

#[tokio::test]
async fn test_join_rate_limited() {
    let service = service_with(Config {
        join_rate_limit_ms: 60_000,
        ..Config::default_for_test()
    })
    .await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    alice.join("room-1").await;
    alice
        .request(ClientRequest::LeaveRoom(RoomRef {
            room_id: RoomId::from("room-1"),
        }))
        .await
        .unwrap();
    assert!(matches!(
        alice.try_join("room-1").await,
        Err(VoiceError::RateLimited)
    ));
}

#[tokio::test]
async fn test_consume_preconditions() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    let mic = alice.produce_audio().await;

    bob.join("room-1").await;
    bob.register_capabilities().await;
    assert!(matches!(
        bob.consume(mic).await,
        Err(VoiceError::TransportNotReady)
    ));

    // own producer
    assert!(matches!(
        alice.consume(mic).await,
        Err(VoiceError::Consume { .. })
    ));

    // unknown producer
    bob.open_transport(TransportDirection::Recv).await;
    assert!(matches!(
        bob.consume(vc_common::ProducerId::new()).await,
        Err(VoiceError::Consume { .. })
    ));
}

#[tokio::test]
async fn test_transport_and_producer_limits() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    alice.join_ready("room-1").await;

    let second = alice
        .request(ClientRequest::CreateTransport(
            vc_common::protocol::CreateTransport {
                room_id: alice.room_id(),
                direction: TransportDirection::Send,
            },
        ))
        .await;
    assert!(matches!(second, Err(VoiceError::InvalidState(_))));

    alice.produce_audio().await;
    assert!(matches!(
        alice
            .produce(TrackSource::Microphone, audio_parameters(5555), None)
            .await,
        Err(VoiceError::Produce(_))
    ));
    // kind must match the codec
    assert!(matches!(
        alice
            .produce(TrackSource::Camera, audio_parameters(6666), None)
            .await,
        Err(VoiceError::Produce(_))
    ));
}

#[tokio::test]
async fn test_stop_screen_share_closes_both_tracks() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    bob.join_ready("room-1").await;

    let video = alice
        .produce(TrackSource::ScreenVideo, video_parameters(7777), None)
        .await
        .unwrap();
    let audio = alice
        .produce(TrackSource::ScreenAudio, audio_parameters(8888), None)
        .await
        .unwrap();
    let peer = alice.session.membership().unwrap();
    assert!(peer.media_state().screen_sharing);
    bob.drain();

    alice
        .request(ClientRequest::StopScreenShare(ProducerRef {
            room_id: alice.room_id(),
            producer_id: video,
        }))
        .await
        .unwrap();

    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();
    assert!(router.producer(video).is_none());
    assert!(router.producer(audio).is_none());
    assert!(!peer.media_state().screen_sharing);

    let events = bob.drain();
    assert_eq!(
        count(&events, |n| matches!(n, ServerNotification::ProducerClosed { .. })),
        2
    );
    assert!(events.iter().any(|n| matches!(
        n,
        ServerNotification::PeerMediaState { state, .. } if !state.screen_sharing
    )));
}

#[tokio::test]
async fn test_stop_video_rejects_other_sources() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    alice.join_ready("room-1").await;
    let mic = alice.produce_audio().await;

    let result = alice
        .request(ClientRequest::StopVideo(ProducerRef {
            room_id: alice.room_id(),
            producer_id: mic,
        }))
        .await;
    assert!(matches!(result, Err(VoiceError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_set_media_state_broadcasts() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join("room-1").await;
    bob.join("room-1").await;
    bob.drain();

    alice
        .request(ClientRequest::SetMediaState(SetMediaState {
            room_id: alice.room_id(),
            muted: None,
            deafened: Some(true),
        }))
        .await
        .unwrap();

    match bob.next_notification().await {
        ServerNotification::PeerMediaState { peer_id, state } => {
            assert_eq!(peer_id, alice.peer_id());
            assert!(state.deafened);
            assert!(!state.muted);
        }
        other => panic!("expected peer-media-state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_worker_death_closes_rooms() {
    let service = service_with(Config {
        media_workers: 1,
        ..Config::default_for_test()
    })
    .await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    alice.join("room-1").await;

    let pool = service.registry().pool().clone();
    pool.workers()[0].close();

    let mut saw_room_closed = false;
    for _ in 0..4 {
        if let ServerNotification::RoomClosed { room_id, .. } = alice.next_notification().await {
            assert_eq!(room_id, RoomId::from("room-1"));
            saw_room_closed = true;
            break;
        }
    }
    assert!(saw_room_closed);

    // membership is gone once the watcher has torn the room down
    for _ in 0..50 {
        if alice.session.membership().is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(alice.session.membership().is_none());
    assert!(service.room(&RoomId::from("room-1")).is_none());
}

// ============================================================================
// Requests racing a leave
// ============================================================================

#[tokio::test]
async fn test_transport_created_while_leaving_is_closed() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    alice.join("room-1").await;
    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();

    // leave has started but the peer is still in the room
    let peer = alice.session.membership().unwrap();
    peer.cancel_token().cancel();

    assert!(matches!(
        alice.create_transport(TransportDirection::Send).await,
        Err(VoiceError::InvalidState(_))
    ));
    assert!(peer.transport(TransportDirection::Send).is_none());
    assert!(router.transports_of(alice.peer_id()).is_empty());
}

#[tokio::test]
async fn test_producer_created_while_leaving_is_closed() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    bob.join("room-1").await;
    bob.drain();
    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();

    let peer = alice.session.membership().unwrap();
    peer.cancel_token().cancel();

    assert!(matches!(
        alice
            .produce(TrackSource::Microphone, audio_parameters(1111), None)
            .await,
        Err(VoiceError::InvalidState(_))
    ));
    assert!(router.producers().is_empty());
    assert!(peer.producer(TrackSource::Microphone).is_none());
    assert_eq!(
        count(&bob.drain(), |n| matches!(n, ServerNotification::NewProducer(_))),
        0,
        "a discarded producer is never announced"
    );
}

#[tokio::test]
async fn test_consumer_created_while_leaving_is_closed() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join_ready("room-1").await;
    let mic = alice.produce_audio().await;
    bob.join_ready("room-1").await;
    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();

    let peer = bob.session.membership().unwrap();
    peer.cancel_token().cancel();

    assert!(matches!(
        bob.consume(mic).await,
        Err(VoiceError::InvalidState(_))
    ));
    assert!(router.consumers_of(mic).is_empty());
    assert!(peer.consumers().lock().await.is_empty());
}

// ============================================================================
// Timeouts and backpressure
// ============================================================================

#[tokio::test]
async fn test_timed_out_request_is_aborted() {
    let service = service_with(Config {
        signaling_request_timeout_ms: 300,
        ..Config::default_for_test()
    })
    .await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    alice.join("room-1").await;
    let options = alice
        .create_transport(TransportDirection::Send)
        .await
        .unwrap();
    let router = service.registry().get_router(&RoomId::from("room-1")).unwrap();

    // Nobody answers the connectivity checks, so the handshake outlives the
    // request.
    let frame = ClientRequest::ConnectTransport(ConnectTransport {
        room_id: alice.room_id(),
        transport_id: options.id,
        ice_parameters: IceParameters {
            username_fragment: "clientufrag".into(),
            password: "clientpasswordclientpassword".into(),
            ice_lite: false,
        },
        dtls_parameters: DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: vec!["3F"; 32].join(":"),
            }],
        },
    })
    .to_frame(Some(9))
    .unwrap();
    service.handle_frame(&alice.session, &frame).await;

    let ack = alice.next_ack().await;
    assert_eq!(ack.ack, 9);
    assert!(!ack.ok);
    assert_eq!(ack.error.unwrap().code, ErrorCode::Timeout);

    // the abandoned handshake is torn down well before its own timeout
    match alice.next_notification().await {
        ServerNotification::TransportClosed { transport_id, .. } => {
            assert_eq!(transport_id, options.id);
        }
        other => panic!("expected transport-closed, got {other:?}"),
    }
    assert!(router.transport(options.id).is_none());
    let peer = alice.session.membership().unwrap();
    assert!(peer.transport(TransportDirection::Send).is_none());
}

#[tokio::test]
async fn test_event_queue_overflow_closes_session() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;
    alice.join("room-1").await;
    bob.join("room-1").await;
    alice.drain();

    // bob stops reading while alice keeps changing state
    for i in 0..=SESSION_CHANNEL_CAPACITY {
        alice
            .request(ClientRequest::SetMediaState(SetMediaState {
                room_id: alice.room_id(),
                muted: Some(i % 2 == 0),
                deafened: None,
            }))
            .await
            .unwrap();
    }

    assert!(bob.session.outbox().is_overflowed());
    tokio::time::timeout(Duration::from_secs(1), bob.session.overflowed())
        .await
        .expect("overflow signalled");
    assert!(!alice.session.outbox().is_overflowed());
}

// ============================================================================
// Mesh calls
// ============================================================================

#[tokio::test]
async fn test_call_relay_and_disconnect() {
    let service = service().await;
    let mut alice = TestPeer::connect(&service, "alice").await;
    let mut bob = TestPeer::connect(&service, "bob").await;

    let data = alice
        .request(ClientRequest::CallStart(vc_common::protocol::CallStart {
            call_id: None,
            targets: vec![bob.peer_id()],
        }))
        .await
        .unwrap();
    let started: vc_common::protocol::CallStartResponse = serde_json::from_value(data).unwrap();
    let call_id = started.call_id;

    match bob.next_notification().await {
        ServerNotification::CallIncoming { call_id: id, from, username } => {
            assert_eq!(id, call_id);
            assert_eq!(from, alice.peer_id());
            assert_eq!(username, "alice");
        }
        other => panic!("expected call:incoming, got {other:?}"),
    }

    bob.request(ClientRequest::CallJoin(vc_common::protocol::CallRef { call_id }))
        .await
        .unwrap();
    alice.drain();

    bob.request(ClientRequest::CallOffer(
        vc_common::protocol::CallSessionDescription {
            call_id,
            to: alice.peer_id(),
            sdp: "v=0".into(),
        },
    ))
    .await
    .unwrap();
    match alice.next_notification().await {
        ServerNotification::CallOffer { from, sdp, .. } => {
            assert_eq!(from, bob.peer_id());
            assert_eq!(sdp, "v=0");
        }
        other => panic!("expected call offer, got {other:?}"),
    }

    service.disconnect(&bob.session).await;
    let ended = alice.drain().into_iter().find_map(|n| match n {
        ServerNotification::CallEnded { reason, .. } => Some(reason),
        _ => None,
    });
    assert_eq!(ended, Some(CallEndReason::LastLeft));
    assert_eq!(service.calls().active_calls(), 0);
}
