//! RTP Plumbing
//!
//! Tasks moving packets between the DTLS transports and the producer /
//! consumer graph. A reader per producer feeds [`Producer::receive_rtp`]; a
//! writer per consumer drains its packet queue into a local track bound to
//! the subscriber's transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use vc_common::ortc::MediaReceiver;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use super::consumer::Consumer;
use super::producer::Producer;

/// Read buffer per producer, one MTU.
const RTP_READ_BUFFER: usize = 1500;

/// Read RTP from the client's stream until the producer or track ends.
pub(crate) fn spawn_rtp_reader(producer: Arc<Producer>, receiver: MediaReceiver) {
    tokio::spawn(async move {
        let track = receiver.track();
        let mut buf = vec![0u8; RTP_READ_BUFFER];

        loop {
            tokio::select! {
                () = producer.ended() => break,
                read = track.read(&mut buf) => match read {
                    Ok((packet, _attributes)) => {
                        producer.receive_rtp(&packet);
                    }
                    Err(e) => {
                        debug!(
                            producer_id = %producer.id(),
                            error = %e,
                            "RTP read loop ended"
                        );
                        break;
                    }
                },
            }
        }

        let _ = receiver.stop().await;
    });
}

/// Write a consumer's forwarded packets to the subscriber until it closes.
pub(crate) fn spawn_rtp_writer(
    consumer: Arc<Consumer>,
    mut packets: mpsc::Receiver<Packet>,
    track: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = consumer.ended() => break,
                packet = packets.recv() => {
                    let Some(packet) = packet else { break };
                    if let Err(e) = track.write_rtp(&packet).await {
                        debug!(
                            consumer_id = %consumer.id(),
                            error = %e,
                            "Failed to forward RTP packet"
                        );
                    }
                }
            }
        }

        debug!(consumer_id = %consumer.id(), "RTP writer stopped");
        let _ = sender.stop().await;
    });
}
