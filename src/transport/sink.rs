use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};

use super::{client::TransportClient, protocol::ClientMessage};
use crate::{
    config::TransportMode,
    error::{SinkError, TransportError},
    pipeline::dispatch::{Emission, Sink},
    types::Frame,
};

/// Forwards dispatched cycles to the remote consumer, as keypoints or as
/// JPEG-encoded frames depending on the transport mode.
pub struct TransportSink {
    client: TransportClient,
    mode: TransportMode,
    jpeg_quality: u8,
}

impl TransportSink {
    pub fn new(client: TransportClient, mode: TransportMode, jpeg_quality: u8) -> Self {
        Self {
            client,
            mode,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn message_for(&self, emission: &Emission<'_>) -> Result<Option<ClientMessage>, SinkError> {
        let timestamp_us = emission.timestamp.as_micros();
        match self.mode {
            // Keypoints only go out for cycles that found a subject.
            TransportMode::Keypoints => Ok(emission.pose.map(|pose| ClientMessage::Keypoints {
                timestamp_us,
                landmarks: pose.landmarks().to_vec(),
            })),
            TransportMode::RawFrame => {
                let frame = emission.frame;
                Ok(Some(ClientMessage::Frame {
                    timestamp_us,
                    width: frame.width,
                    height: frame.height,
                    jpeg_data: encode_jpeg(frame, self.jpeg_quality)?,
                }))
            }
        }
    }
}

impl Sink for TransportSink {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn send(&mut self, emission: &Emission<'_>) -> Result<(), SinkError> {
        if self.mode == TransportMode::Keypoints && emission.pose.is_none() {
            return Ok(());
        }
        // Skip the JPEG encode when the message would be dropped anyway.
        if !self.client.is_connected() {
            return Err(TransportError::Disconnected.into());
        }
        match self.message_for(emission)? {
            Some(msg) => Ok(self.client.send(msg)?),
            None => Ok(()),
        }
    }
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, SinkError> {
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.width == 0 || frame.height == 0 || frame.rgba.len() != expected {
        return Err(SinkError::FrameSize {
            width: frame.width,
            height: frame.height,
        });
    }

    let rgb: Vec<u8> = frame
        .rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode(
        &rgb,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        transport::protocol,
        types::{FrameTimestamp, Landmark, PoseResult},
    };

    fn frame() -> Frame {
        Frame {
            rgba: (0..16 * 8)
                .flat_map(|i| [(i * 2) as u8, 128, 255 - i as u8, 255])
                .collect(),
            width: 16,
            height: 8,
            timestamp: FrameTimestamp::from_millis(40),
        }
    }

    async fn connected_sink(
        mode: TransportMode,
    ) -> (TransportSink, protocol::MessageStream<tokio::net::TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (inbound_tx, _inbound_rx) = crossbeam_channel::bounded(1);
        let client = TransportClient::connect(addr, inbound_tx).unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !client.is_connected() {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (TransportSink::new(client, mode, 80), protocol::message_stream(socket))
    }

    #[test]
    fn encodes_a_decodable_jpeg() {
        let jpeg = encode_jpeg(&frame(), 80).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn refuses_truncated_frames() {
        let mut frame = frame();
        frame.rgba.pop();
        assert!(matches!(
            encode_jpeg(&frame, 80),
            Err(SinkError::FrameSize { width: 16, height: 8 })
        ));
    }

    #[tokio::test]
    async fn keypoints_mode_sends_only_found_subjects() {
        let (mut sink, mut server) = connected_sink(TransportMode::Keypoints).await;
        let frame = frame();
        let pose = PoseResult::new(vec![Landmark::new(0.3, 0.4, 0.0); 33]);

        sink.send(&Emission {
            timestamp: frame.timestamp,
            frame: &frame,
            pose: None,
        })
        .unwrap();
        sink.send(&Emission {
            timestamp: frame.timestamp,
            frame: &frame,
            pose: Some(&pose),
        })
        .unwrap();

        let received: Option<ClientMessage> = protocol::recv_message(&mut server).await.unwrap();
        assert_eq!(
            received,
            Some(ClientMessage::Keypoints {
                timestamp_us: 40_000,
                landmarks: pose.landmarks().to_vec(),
            })
        );
    }

    #[tokio::test]
    async fn raw_frame_mode_sends_jpeg_frames() {
        let (mut sink, mut server) = connected_sink(TransportMode::RawFrame).await;
        let frame = frame();

        sink.send(&Emission {
            timestamp: frame.timestamp,
            frame: &frame,
            pose: None,
        })
        .unwrap();

        match protocol::recv_message(&mut server).await.unwrap() {
            Some(ClientMessage::Frame {
                timestamp_us,
                width,
                height,
                jpeg_data,
            }) => {
                assert_eq!((timestamp_us, width, height), (40_000, 16, 8));
                assert!(image::load_from_memory(&jpeg_data).is_ok());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnected_link_is_a_sink_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (inbound_tx, _inbound_rx) = crossbeam_channel::bounded(1);
        let client = TransportClient::connect(addr, inbound_tx).unwrap();
        let mut sink = TransportSink::new(client, TransportMode::Keypoints, 80);
        let frame = frame();
        let pose = PoseResult::new(vec![Landmark::default(); 33]);

        let result = sink.send(&Emission {
            timestamp: frame.timestamp,
            frame: &frame,
            pose: Some(&pose),
        });
        assert!(matches!(
            result,
            Err(SinkError::Transport(TransportError::Disconnected))
        ));

        // Nothing to send, so nothing to fail.
        let result = sink.send(&Emission {
            timestamp: frame.timestamp,
            frame: &frame,
            pose: None,
        });
        assert!(result.is_ok());
    }
}
