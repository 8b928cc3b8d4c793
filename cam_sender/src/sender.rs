//! Stream frames to the park server over the data socket.
//!
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use common::protocol::{FrameMsg, ProtoMsg};
use futures::{SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::Error;

pub type Transport<T> = Framed<T, LengthDelimitedCodec>;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connect to the data socket of the park server.
pub async fn connect(address: &str) -> Result<Transport<TcpStream>, Error> {
    let stream = TcpStream::connect(address).await?;
    log::info!("Connected to {address}");
    Ok(Framed::new(stream, LengthDelimitedCodec::new()))
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn send_msg<T>(transport: &mut Transport<T>, msg: &ProtoMsg) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport.send(Bytes::from(msg.serialize()?)).await?;
    Ok(())
}

/// Announce the camera and send frames until the stream ends.
///
/// Returns the number of frames sent. `Bye` goes out only when the frames ran out, a failed
/// connection returns the error and leaves the stream usable for the next connection.
pub async fn send_frames<T, S>(
    transport: &mut Transport<T>,
    camera_id: &str,
    frames: &mut S,
) -> Result<u64, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Stream<Item = Bytes> + Unpin,
{
    send_msg(
        transport,
        &ProtoMsg::Hello {
            camera_id: camera_id.to_owned(),
        },
    )
    .await?;

    let mut sent = 0;
    while let Some(jpeg) = frames.next().await {
        let msg = ProtoMsg::Frame(FrameMsg::new(camera_id.to_owned(), timestamp_ms(), jpeg.to_vec()));
        send_msg(transport, &msg).await?;

        sent += 1;
        if sent % 100 == 0 {
            log::debug!("Sent {sent} frames");
        }
    }

    send_msg(transport, &ProtoMsg::Bye).await?;
    log::info!("Frames ran out after {sent} frames");

    Ok(sent)
}

/// Reconnect delay which doubles on every failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: MIN_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = MIN_BACKOFF;
    }
}
