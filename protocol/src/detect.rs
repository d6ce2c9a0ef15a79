//! Protocol detection on a fresh TCP stream
//!
//! Reads a small prefix under a deadline and classifies the connection as
//! Stratum V1 (line-delimited JSON) or Stratum V2 (binary frames). The
//! consumed prefix is handed back so the chosen handler can replay it.

use std::time::Duration;

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use orepool_core::ProtocolVariant;

use crate::v2::frame::{FrameHeader, HEADER_SIZE};
use crate::ProtocolError;

/// How many prefix bytes detection may consume
pub const DETECT_PREFIX_LEN: usize = 16;

/// Classification result plus the consumed bytes to replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detected {
    /// Recognized variant; `prefix` must be replayed into the handler
    Variant {
        variant: ProtocolVariant,
        prefix: Vec<u8>,
    },
    /// Neither variant; close without replying
    Unknown,
}

/// Classify an already-read prefix.
///
/// A prefix opening with `{` or `[` and carrying no NUL within the
/// frame-header span is V1; plain text wins the tie-break on this port.
/// Otherwise the first six bytes are tried as a V2 frame header and the
/// declared length checked against bounds.
pub fn classify(prefix: &[u8]) -> Detected {
    if prefix.is_empty() {
        return Detected::Unknown;
    }

    let header_span = &prefix[..prefix.len().min(HEADER_SIZE)];
    if (prefix[0] == b'{' || prefix[0] == b'[') && !header_span.contains(&0) {
        return Detected::Variant {
            variant: ProtocolVariant::V1,
            prefix: prefix.to_vec(),
        };
    }

    if prefix.len() >= HEADER_SIZE {
        if let Ok(header) = FrameHeader::parse(prefix) {
            if header.length_in_bounds() {
                return Detected::Variant {
                    variant: ProtocolVariant::V2,
                    prefix: prefix.to_vec(),
                };
            }
        }
    }

    Detected::Unknown
}

/// Read a prefix from the stream under `deadline` and classify it.
///
/// A read timeout or EOF before any byte arrives is an error; the caller
/// closes the connection either way.
pub async fn detect<S>(stream: &mut S, deadline: Duration) -> Result<Detected, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = Vec::with_capacity(DETECT_PREFIX_LEN);
    let mut buf = [0u8; DETECT_PREFIX_LEN];

    let result = timeout(deadline, async {
        // Keep reading until the header span is available or the peer stops
        while prefix.len() < HEADER_SIZE {
            let n = stream.read(&mut buf[..DETECT_PREFIX_LEN - prefix.len()]).await?;
            if n == 0 {
                break;
            }
            prefix.extend_from_slice(&buf[..n]);

            // A JSON opener classifies as soon as the header span is clean
            if prefix[0] == b'{' || prefix[0] == b'[' {
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ProtocolError::Io(e)),
        Err(_) => return Err(ProtocolError::DetectTimeout),
    }

    let detected = classify(&prefix);
    trace!("detected {:?} from {} prefix bytes", detected_kind(&detected), prefix.len());
    Ok(detected)
}

fn detected_kind(detected: &Detected) -> &'static str {
    match detected {
        Detected::Variant {
            variant: ProtocolVariant::V1,
            ..
        } => "v1",
        Detected::Variant {
            variant: ProtocolVariant::V2,
            ..
        } => "v2",
        Detected::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_prefix_is_v1() {
        let detected = classify(br#"{"id":1,"method":"mining.subscribe"#);
        assert!(matches!(
            detected,
            Detected::Variant {
                variant: ProtocolVariant::V1,
                ..
            }
        ));
    }

    #[test]
    fn test_json_array_prefix_is_v1() {
        assert!(matches!(
            classify(br#"[{"id":1}]"#),
            Detected::Variant {
                variant: ProtocolVariant::V1,
                ..
            }
        ));
    }

    #[test]
    fn test_v2_header_is_v2() {
        // ext 0xffff, type 0x00, len 32: a noise handshake carrier
        let prefix = [0xff, 0xff, 0x00, 0x20, 0x00, 0x00, 0xaa, 0xbb];
        assert!(matches!(
            classify(&prefix),
            Detected::Variant {
                variant: ProtocolVariant::V2,
                ..
            }
        ));
    }

    #[test]
    fn test_brace_with_nul_is_not_v1() {
        // An opener byte followed by a NUL inside the header span cannot be
        // a JSON line; it falls through to the V2 header check
        let prefix = [b'{', 0x00, 0x01, 0x10, 0x00, 0x00];
        let detected = classify(&prefix);
        assert!(matches!(
            detected,
            Detected::Variant {
                variant: ProtocolVariant::V2,
                ..
            }
        ));
    }

    #[test]
    fn test_oversized_v2_length_is_unknown() {
        // Declared length 0xffffff exceeds the frame bound
        let prefix = [0x00, 0x00, 0x1a, 0xff, 0xff, 0xff];
        assert_eq!(classify(&prefix), Detected::Unknown);
    }

    #[test]
    fn test_empty_prefix_is_unknown() {
        assert_eq!(classify(&[]), Detected::Unknown);
    }

    #[test]
    fn test_short_binary_prefix_is_unknown() {
        assert_eq!(classify(&[0x01, 0x02]), Detected::Unknown);
    }

    #[tokio::test]
    async fn test_detect_reads_and_replays_prefix() {
        let line = br#"{"id":1,"method":"mining.subscribe","params":[]}"#;
        let mut stream = std::io::Cursor::new(line.to_vec());
        let detected = detect(&mut stream, Duration::from_secs(1)).await.unwrap();
        match detected {
            Detected::Variant { variant, prefix } => {
                assert_eq!(variant, ProtocolVariant::V1);
                assert!(!prefix.is_empty());
                assert!(line.starts_with(&prefix[..]));
            }
            Detected::Unknown => panic!("expected v1"),
        }
    }

    #[tokio::test]
    async fn test_detect_eof_is_unknown() {
        let mut stream = std::io::Cursor::new(Vec::new());
        let detected = detect(&mut stream, Duration::from_secs(1)).await.unwrap();
        assert_eq!(detected, Detected::Unknown);
    }
}
