/// TCP transport: length-prefixed JSON frames bridged onto a `Link`
use super::protocol::{ClientFrame, Frame, ServerFrame, MAX_FRAME_LEN};
use super::Link;
use crate::error::{Result, SyncError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Open a TCP connection to the gateway and spawn its reader/writer tasks
pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Link> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SyncError::Timeout(format!("connecting to {}", addr)))?
        .map_err(SyncError::Io)?;
    stream.set_nodelay(true).map_err(SyncError::Io)?;
    info!("Connected to gateway {}", addr);

    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerFrame>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match Frame::encode(&frame) {
                Ok(f) => f.to_bytes(),
                Err(e) => {
                    error!("Failed to encode {}: {}", frame.event.name(), e);
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                warn!("Gateway write failed: {}", e);
                break;
            }
        }
        debug!("Gateway writer stopped");
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match frame.decode::<ServerFrame>() {
                    Ok(server_frame) => {
                        if in_tx.send(server_frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable frame: {}", e),
                },
                Ok(None) => {
                    debug!("Gateway closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Gateway read failed: {}", e);
                    break;
                }
            }
        }
    });

    Ok(Link {
        outbound: out_tx,
        inbound: in_rx,
    })
}

/// Read one frame; `Ok(None)` on clean EOF before a length prefix
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SyncError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(SyncError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            length
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(SyncError::Io)?;
    Ok(Some(Frame {
        length: length as u32,
        payload,
    }))
}
