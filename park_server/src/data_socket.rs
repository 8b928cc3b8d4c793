//! TCP socket receiving JPEG frames from camera senders.
use std::net::SocketAddr;

use anyhow::Result;
use common::protocol::ProtoMsg;
use futures::StreamExt;
use thingbuf::mpsc::{self, errors::TrySendError};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::meter::METER;

/// A received JPEG frame. Slots of the frame channel are reused, so this is `Default`.
#[derive(Debug, Default, Clone)]
pub struct IncomingFrame {
    pub camera_id: String,
    pub timestamp_ms: u64,
    pub jpeg: Vec<u8>,
}

pub type FrameSender = mpsc::Sender<IncomingFrame>;
pub type FrameReceiver = mpsc::Receiver<IncomingFrame>;

/// Bounded channel between the socket and the detection loop.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    mpsc::channel(capacity)
}

/// Listen for camera senders. Returns the bound address and the handle of the accept loop.
pub async fn spawn_data_socket(
    frame_tx: FrameSender,
    addr: &str,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    log::info!("Data socket listening on {local_addr}");

    let handle = tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await?;
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_incoming(socket, frame_tx).await {
                    log::warn!("Camera connection failed: {e}");
                }
            });
        }
    });

    Ok((local_addr, handle))
}

async fn handle_incoming(stream: TcpStream, frame_tx: FrameSender) -> Result<()> {
    let peer = stream.peer_addr()?;
    log::info!("{peer}: New connection");

    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());
    let mut dropped = 0_u64;

    while let Some(data) = transport.next().await {
        let data = data?;
        let frame_msg = match ProtoMsg::deserialize(&data[..]) {
            Ok(ProtoMsg::Frame(frame_msg)) => frame_msg,
            Ok(ProtoMsg::Hello { camera_id }) => {
                log::info!("{peer}: Camera {camera_id} connected");
                continue;
            }
            Ok(ProtoMsg::Bye) => {
                log::info!("{peer}: Camera said goodbye");
                break;
            }
            Err(e) => {
                log::warn!("{peer}: Skipping undecodable message: {e}");
                continue;
            }
        };

        if frame_msg.jpeg.is_empty() {
            log::warn!("{peer}: Skipping empty frame of {}", frame_msg.camera_id);
            continue;
        }
        METER.tick_received();

        match frame_tx.try_send_ref() {
            Ok(mut slot) => {
                slot.camera_id.clear();
                slot.camera_id.push_str(&frame_msg.camera_id);
                slot.timestamp_ms = frame_msg.timestamp_ms;
                slot.jpeg.clear();
                slot.jpeg.extend_from_slice(&frame_msg.jpeg);
            }
            Err(TrySendError::Full(_)) => {
                // Detection is busy, the frame is stale by the time it would be processed
                dropped += 1;
                if dropped % 100 == 1 {
                    log::debug!("{peer}: Dropped {dropped} frames so far");
                }
            }
            Err(_) => {
                log::info!("{peer}: Frame channel closed");
                break;
            }
        }
    }

    log::info!("{peer}: Connection closed");
    Ok(())
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use common::protocol::FrameMsg;
    use futures::SinkExt;

    use super::*;

    #[tokio::test]
    async fn test_frames_reach_the_channel() -> Result<()> {
        let (frame_tx, frame_rx) = frame_channel(4);
        let (addr, _handle) = spawn_data_socket(frame_tx, "127.0.0.1:0").await?;

        let stream = TcpStream::connect(addr).await?;
        let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

        let hello = ProtoMsg::Hello {
            camera_id: "cam-1".into(),
        };
        transport.send(Bytes::from(hello.serialize()?)).await?;
        transport.send(Bytes::from_static(b"garbage")).await?;
        let empty = ProtoMsg::Frame(FrameMsg::new("cam-1".into(), 1, vec![]));
        transport.send(Bytes::from(empty.serialize()?)).await?;
        let frame = ProtoMsg::Frame(FrameMsg::new("cam-1".into(), 2, vec![0xff, 0xd8]));
        transport.send(Bytes::from(frame.serialize()?)).await?;

        let received = frame_rx.recv().await.expect("frame expected");
        assert_eq!(received.camera_id, "cam-1");
        assert_eq!(received.timestamp_ms, 2);
        assert_eq!(received.jpeg, vec![0xff, 0xd8]);

        Ok(())
    }
}
