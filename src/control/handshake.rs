//! Connection setup: COTP connect followed by S7 communication setup.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::cotp::{ConnectionConfirm, ConnectionRequest};
use crate::codec::setup::{CommunicationSetup, CommunicationSetupAck};
use crate::codec::{decode, encode};
use crate::error::{Result, S7Error};
use crate::protocol::{Frame, FrameReader};

/// Values agreed with the PLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub pdu_size: u16,
    /// Parallel jobs we may issue.
    pub capacity: u16,
}

/// Run the connection setup on a freshly connected stream.
///
/// The whole exchange is bounded by `timeout`; the PLC's job count is
/// capped at what was requested.
pub async fn negotiate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    connect: &ConnectionRequest,
    setup: &CommunicationSetup,
    pdu_ref: u16,
    timeout: Duration,
) -> Result<Negotiated>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        writer.write_all(&connect.encode()).await?;
        let confirm = ConnectionConfirm::decode(&expect_frame(reader).await?)?;
        tracing::debug!(
            remote_tsap = connect.remote_tsap,
            tpdu_size = ?confirm.tpdu_size,
            "COTP connection confirmed"
        );

        writer.write_all(&encode(setup, pdu_ref)?).await?;
        let frame = expect_frame(reader).await?;
        if frame.pdu_ref() != Some(pdu_ref) {
            return Err(S7Error::protocol(format!(
                "Communication setup answered with reference {:?}, expected {}",
                frame.pdu_ref(),
                pdu_ref
            )));
        }
        let ack: CommunicationSetupAck = decode(&frame)?;
        accept(setup, &ack)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(S7Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connection setup timed out",
        ))),
    }
}

async fn expect_frame<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Frame> {
    reader.next_frame().await?.ok_or_else(|| {
        S7Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "PLC closed the connection during setup",
        ))
    })
}

fn accept(setup: &CommunicationSetup, ack: &CommunicationSetupAck) -> Result<Negotiated> {
    if ack.pdu_size == 0 {
        return Err(S7Error::protocol("PLC negotiated a PDU size of 0"));
    }
    let capacity = ack.max_amq_calling.min(setup.max_amq_calling).max(1);
    let negotiated = Negotiated {
        pdu_size: ack.pdu_size,
        capacity,
    };
    tracing::debug!(
        pdu_size = negotiated.pdu_size,
        capacity = negotiated.capacity,
        "Communication setup negotiated"
    );
    Ok(negotiated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncReadExt};

    async fn read_telegram<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await.unwrap();
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut rest = vec![0u8; len - 4];
        reader.read_exact(&mut rest).await.unwrap();
        [header.to_vec(), rest].concat()
    }

    #[tokio::test]
    async fn test_negotiate() {
        let (client, server) = duplex(1024);
        let (client_read, mut client_write) = split(client);
        let (mut server_read, mut server_write) = split(server);

        let plc = tokio::spawn(async move {
            let cr = read_telegram(&mut server_read).await;
            assert_eq!(cr[5], 0xE0);
            let request = ConnectionRequest::new(0x0102);
            server_write
                .write_all(&ConnectionConfirm::answer(&request).encode())
                .await
                .unwrap();

            let setup = read_telegram(&mut server_read).await;
            assert_eq!(setup[7], 0x32);
            assert_eq!(setup[17], 0xF0);
            let ack = CommunicationSetupAck::new(3, 3, 480);
            server_write.write_all(&encode(&ack, 1).unwrap()).await.unwrap();
        });

        let mut reader = FrameReader::new(client_read);
        let negotiated = negotiate(
            &mut reader,
            &mut client_write,
            &ConnectionRequest::new(0x0102),
            &CommunicationSetup::new(10, 10, 960),
            1,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(
            negotiated,
            Negotiated {
                pdu_size: 480,
                capacity: 3
            }
        );
        plc.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_timeout() {
        let (client, _server) = duplex(1024);
        let (client_read, mut client_write) = split(client);
        let mut reader = FrameReader::new(client_read);

        let result = negotiate(
            &mut reader,
            &mut client_write,
            &ConnectionRequest::new(0x0102),
            &CommunicationSetup::new(1, 1, 240),
            1,
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(S7Error::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut));
    }

    #[test]
    fn test_capacity_capped_by_request() {
        let setup = CommunicationSetup::new(2, 2, 960);
        let negotiated = accept(&setup, &CommunicationSetupAck::new(8, 8, 960)).unwrap();
        assert_eq!(negotiated.capacity, 2);

        let negotiated = accept(&setup, &CommunicationSetupAck::new(0, 0, 240)).unwrap();
        assert_eq!(negotiated.capacity, 1);

        assert!(accept(&setup, &CommunicationSetupAck::new(1, 1, 0)).is_err());
    }
}
