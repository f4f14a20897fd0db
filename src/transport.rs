//! Reading and writing whole PDUs on a byte stream.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::association_error::AssociationError;
use crate::error::PduError;
use crate::pdu::{Pdu, decode_pdu, encode_pdu, pdu_header};
use crate::statistics::{StatisticsEvent, StatisticsSink};

/// P-DATA-TF type byte, the only PDU bound by the negotiated maximum length.
const P_DATA_TF: u8 = 0x04;

/// Longest association, release or abort PDU we will buffer.
pub const MAX_ASSOCIATION_PDU_LENGTH: u32 = 256 * 1024;

/// How far past the maximum length a P-DATA-TF may run when not strict.
pub const P_DATA_LENGTH_SLACK: u32 = 64 * 1024;

/// A byte stream framed into PDUs.
///
/// [PduStream::receive] is cancel-safe: bytes read before the future is dropped stay buffered.
#[derive(Debug)]
pub struct PduStream<S> {
    stream: S,
    buffer: BytesMut,
    max_pdu_length: u32,
    strict: bool,
    statistics: Arc<dyn StatisticsSink>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PduStream<S> {
    pub fn new(stream: S, statistics: Arc<dyn StatisticsSink>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(crate::pdu::DEFAULT_MAX_PDU as usize),
            max_pdu_length: 0,
            strict: false,
            statistics,
        }
    }

    /// Refuse P-DATA-TF PDUs longer than `max_pdu_length`, or than that plus
    /// [P_DATA_LENGTH_SLACK] unless `strict`. 0 means unlimited.
    pub fn set_max_pdu_length(&mut self, max_pdu_length: u32, strict: bool) {
        self.max_pdu_length = max_pdu_length;
        self.strict = strict;
    }

    /// Wait for the next PDU. `None` when the peer closed the connection between PDUs.
    ///
    /// A PDU whose header announces more than [PduStream::length_ceiling] is refused
    /// before its body is read.
    pub async fn receive(&mut self) -> Result<Option<Pdu>, AssociationError> {
        loop {
            if let Some((pdu_type, length)) = pdu_header(&self.buffer)? {
                let maximum = self.length_ceiling(pdu_type);
                if length > maximum {
                    return Err(PduError::TooLarge { length, maximum }.into());
                }
            }
            if let Some((pdu, consumed)) = decode_pdu(&self.buffer)? {
                self.buffer.advance(consumed);
                self.statistics
                    .record_event(StatisticsEvent::PduReceived, consumed);
                return Ok(Some(pdu));
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(AssociationError::ConnectionClosed)
                };
            }
        }
    }

    /// Largest body length accepted for a PDU of this type.
    fn length_ceiling(&self, pdu_type: u8) -> u32 {
        if pdu_type != P_DATA_TF {
            return MAX_ASSOCIATION_PDU_LENGTH;
        }
        match (self.max_pdu_length, self.strict) {
            (0, _) => u32::MAX,
            (max, true) => max,
            (max, false) => max.saturating_add(P_DATA_LENGTH_SLACK),
        }
    }

    pub async fn send(&mut self, pdu: &Pdu) -> Result<(), AssociationError> {
        let bytes = encode_pdu(pdu)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.statistics
            .record_event(StatisticsEvent::PduSent, bytes.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AssociationError> {
        Ok(self.stream.shutdown().await?)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AbortReason, AbortSource, PDataValue, PDataValueType};
    use crate::statistics::Statistics;
    use pretty_assertions::assert_eq;

    fn pdata(len: usize) -> Pdu {
        Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0x55; len],
            }],
        }
    }

    #[tokio::test]
    async fn test_receive_pdus_split_across_reads() {
        let (client, mut server) = tokio::io::duplex(64);
        let statistics = Arc::new(Statistics::default());
        let mut stream = PduStream::new(client, statistics.clone());

        let mut bytes = encode_pdu(&pdata(300)).unwrap().to_vec();
        bytes.extend_from_slice(&encode_pdu(&Pdu::ReleaseRQ).unwrap());
        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                server.write_all(chunk).await.unwrap();
            }
            server
        });

        assert_eq!(stream.receive().await.unwrap(), Some(pdata(300)));
        assert_eq!(stream.receive().await.unwrap(), Some(Pdu::ReleaseRQ));
        drop(writer.await.unwrap());
        assert_eq!(stream.receive().await.unwrap(), None);
        assert_eq!(statistics.pdus_received(), 2);
        assert_eq!(statistics.bytes_received(), 6 + 6 + 300 + 10);
    }

    #[tokio::test]
    async fn test_strict_maximum_length() {
        let (client, server) = tokio::io::duplex(4096);
        let mut receiver = PduStream::new(client, Arc::new(Statistics::default()));
        receiver.set_max_pdu_length(100, true);
        let mut sender = PduStream::new(server, Arc::new(Statistics::default()));

        sender.send(&pdata(94)).await.unwrap();
        sender.send(&pdata(95)).await.unwrap();
        assert_eq!(receiver.receive().await.unwrap(), Some(pdata(94)));
        assert!(matches!(
            receiver.receive().await,
            Err(AssociationError::Pdu(PduError::TooLarge {
                length: 101,
                maximum: 100
            }))
        ));
    }

    #[tokio::test]
    async fn test_lenient_maximum_length_has_slack() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut receiver = PduStream::new(client, Arc::new(Statistics::default()));
        receiver.set_max_pdu_length(100, false);
        let mut sender = PduStream::new(server, Arc::new(Statistics::default()));

        sender.send(&pdata(95)).await.unwrap();
        let oversized = 100 + P_DATA_LENGTH_SLACK as usize;
        sender.send(&pdata(oversized)).await.unwrap();
        assert_eq!(receiver.receive().await.unwrap(), Some(pdata(95)));
        assert!(matches!(
            receiver.receive().await,
            Err(AssociationError::Pdu(PduError::TooLarge { maximum, .. }))
                if maximum == 100 + P_DATA_LENGTH_SLACK
        ));
    }

    #[tokio::test]
    async fn test_oversized_association_request_is_refused_from_its_header() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PduStream::new(client, Arc::new(Statistics::default()));
        // Only the header arrives. The announced body is never sent.
        server
            .write_all(&[0x01, 0x00, 0x7F, 0xFF, 0xFF, 0xFF])
            .await
            .unwrap();
        assert!(matches!(
            stream.receive().await,
            Err(AssociationError::Pdu(PduError::TooLarge {
                length: 0x7FFF_FFFF,
                maximum: MAX_ASSOCIATION_PDU_LENGTH,
            }))
        ));
    }

    #[tokio::test]
    async fn test_truncated_pdu_at_end_of_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PduStream::new(client, Arc::new(Statistics::default()));
        let bytes = encode_pdu(&Pdu::AbortRQ {
            source: AbortSource::ServiceUser,
            reason: AbortReason::NotSpecified,
        })
        .unwrap();
        server.write_all(&bytes[..5]).await.unwrap();
        drop(server);
        assert!(matches!(
            stream.receive().await,
            Err(AssociationError::ConnectionClosed)
        ));
    }
}
