//! Noise-encrypted channel for Stratum V2
//!
//! Pattern: `Noise_NX_25519_ChaChaPoly_SHA256`. The server authenticates
//! with a static key, the initiator stays ephemeral. Key scalars are
//! clamped per the X25519 standard and an all-zero Diffie-Hellman output
//! (a low-order peer point) aborts the handshake. The handshake always
//! completes before any mining message. After the handshake every mining
//! frame travels encrypted inside an outer carrier frame; each direction
//! keeps its own monotonic nonce and the channel fails closed on wrap or on
//! any authentication failure.

use bytes::Bytes;
use snow::params::{CipherChoice, DHChoice, HashChoice};
use snow::resolvers::{CryptoResolver, DefaultResolver};
use snow::types::{Cipher, Dh, Hash, Random};
use snow::{Builder, HandshakeState, StatelessTransportState};

use crate::v2::frame::{Frame, FrameHeader};
use crate::ProtocolError;

/// Noise parameter string for the V2 channel
pub const NOISE_PARAMS: &str = "Noise_NX_25519_ChaChaPoly_SHA256";

/// Extension type of the outer carrier frames
pub const EXTENSION_NOISE: u16 = 0xffff;

/// Carrier message type for handshake payloads
pub const MSG_HANDSHAKE: u8 = 0x00;

/// Carrier message type for encrypted transport payloads
pub const MSG_ENCRYPTED: u8 = 0x01;

/// Largest ciphertext accepted in one transport message
pub const MAX_CIPHERTEXT: usize = 65535;

/// AEAD tag width for ChaCha20-Poly1305
const TAG_SIZE: usize = 16;

/// Largest plaintext that fits a transport message alongside its tag
pub const MAX_PLAINTEXT: usize = MAX_CIPHERTEXT - TAG_SIZE;

/// Which side of the handshake this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

/// The server's X25519 static key material
#[derive(Clone)]
pub struct NoiseKeypair {
    pub private: [u8; 32],
    /// Known when the key was generated in-process; a key loaded from
    /// config carries only the scalar
    pub public: Option<[u8; 32]>,
}

impl NoiseKeypair {
    /// Generate a fresh keypair
    pub fn generate() -> Result<NoiseKeypair, ProtocolError> {
        let keypair = builder()?.generate_keypair()?;
        let mut private = [0u8; 32];
        let mut public = [0u8; 32];
        private.copy_from_slice(&keypair.private);
        public.copy_from_slice(&keypair.public);
        Ok(NoiseKeypair {
            private,
            public: Some(public),
        })
    }

    /// Load a private scalar from hex, clamping it per the X25519 standard
    pub fn from_private_hex(hex_key: &str) -> Result<NoiseKeypair, ProtocolError> {
        let bytes = hex::decode(hex_key)
            .map_err(|_| ProtocolError::Handshake("noise key is not hex".into()))?;
        if bytes.len() != 32 {
            return Err(ProtocolError::Handshake(format!(
                "noise key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut private = [0u8; 32];
        private.copy_from_slice(&bytes);
        clamp_scalar(&mut private);
        Ok(NoiseKeypair {
            private,
            public: None,
        })
    }
}

/// Clamp an X25519 scalar: clear bits 0..=2 of byte 0, clear bit 7 and set
/// bit 6 of byte 31
pub fn clamp_scalar(scalar: &mut [u8; 32]) {
    scalar[0] &= 0b1111_1000;
    scalar[31] &= 0b0111_1111;
    scalar[31] |= 0b0100_0000;
}

fn params() -> Result<snow::params::NoiseParams, ProtocolError> {
    NOISE_PARAMS
        .parse()
        .map_err(|_| ProtocolError::Handshake("bad noise parameter string".into()))
}

/// Every handshake state goes through this builder so the DH guard below
/// is always in place
fn builder<'a>() -> Result<Builder<'a>, ProtocolError> {
    Ok(Builder::with_resolver(
        params()?,
        Box::new(GuardedResolver(DefaultResolver)),
    ))
}

/// X25519 with degenerate-agreement rejection.
///
/// A low-order remote public key (the zero point among them) collapses the
/// shared secret to all zeros. snow's default backend hands that result
/// through, so the agreement is checked here and fails the handshake.
struct RejectZeroDh {
    inner: Box<dyn Dh>,
}

impl Dh for RejectZeroDh {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn pub_len(&self) -> usize {
        self.inner.pub_len()
    }

    fn priv_len(&self) -> usize {
        self.inner.priv_len()
    }

    fn set(&mut self, privkey: &[u8]) {
        self.inner.set(privkey)
    }

    fn generate(&mut self, rng: &mut dyn Random) {
        self.inner.generate(rng)
    }

    fn pubkey(&self) -> &[u8] {
        self.inner.pubkey()
    }

    fn privkey(&self) -> &[u8] {
        self.inner.privkey()
    }

    fn dh(&self, pubkey: &[u8], out: &mut [u8]) -> Result<(), snow::Error> {
        self.inner.dh(pubkey, out)?;
        let shared = &out[..self.inner.pub_len().min(out.len())];
        if shared.iter().all(|byte| *byte == 0) {
            return Err(snow::Error::Dh);
        }
        Ok(())
    }
}

/// The default resolver with its DH wrapped in [`RejectZeroDh`]
struct GuardedResolver(DefaultResolver);

impl CryptoResolver for GuardedResolver {
    fn resolve_rng(&self) -> Option<Box<dyn Random>> {
        self.0.resolve_rng()
    }

    fn resolve_dh(&self, choice: &DHChoice) -> Option<Box<dyn Dh>> {
        self.0
            .resolve_dh(choice)
            .map(|inner| Box::new(RejectZeroDh { inner }) as Box<dyn Dh>)
    }

    fn resolve_hash(&self, choice: &HashChoice) -> Option<Box<dyn Hash>> {
        self.0.resolve_hash(choice)
    }

    fn resolve_cipher(&self, choice: &CipherChoice) -> Option<Box<dyn Cipher>> {
        self.0.resolve_cipher(choice)
    }
}

/// Handshake-phase wrapper around snow's state machine
pub struct NoiseSession {
    state: HandshakeState,
    role: NoiseRole,
}

impl NoiseSession {
    /// Build the server side with its static key
    pub fn responder(keypair: &NoiseKeypair) -> Result<NoiseSession, ProtocolError> {
        let state = builder()?
            .local_private_key(&keypair.private)
            .build_responder()
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        Ok(NoiseSession {
            state,
            role: NoiseRole::Responder,
        })
    }

    /// Build a client side (used by tests and the probe tooling)
    pub fn initiator() -> Result<NoiseSession, ProtocolError> {
        let state = builder()?
            .build_initiator()
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        Ok(NoiseSession {
            state,
            role: NoiseRole::Initiator,
        })
    }

    pub fn role(&self) -> NoiseRole {
        self.role
    }

    /// Consume an inbound handshake message
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; MAX_CIPHERTEXT];
        let len = self
            .state
            .read_message(message, &mut buf)
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Produce the next outbound handshake message
    pub fn write_message(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; MAX_CIPHERTEXT];
        let len = self
            .state
            .write_message(&[], &mut buf)
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Promote the finished handshake into AEAD transport
    pub fn into_transport(self) -> Result<NoiseTransport, ProtocolError> {
        let state = self
            .state
            .into_stateless_transport_mode()
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        Ok(NoiseTransport {
            state,
            tx_nonce: 0,
            rx_nonce: 0,
        })
    }
}

/// Post-handshake AEAD transport with explicit nonce discipline
pub struct NoiseTransport {
    state: StatelessTransportState,
    tx_nonce: u64,
    rx_nonce: u64,
}

impl NoiseTransport {
    /// Encrypt one message; the nonce advances exactly once per call
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let (ciphertext, next) =
            encrypt_with(&self.state, self.tx_nonce, plaintext)?;
        self.tx_nonce = next;
        Ok(ciphertext)
    }

    /// Decrypt one message; size is checked before any AEAD work
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let (plaintext, next) =
            decrypt_with(&self.state, self.rx_nonce, ciphertext)?;
        self.rx_nonce = next;
        Ok(plaintext)
    }

    /// Split into independent directions so the connection's reader and
    /// writer tasks each own their nonce sequence. The AEAD state is shared
    /// immutably; only the nonces are per-direction.
    pub fn split(self) -> (NoiseSender, NoiseReceiver) {
        let state = std::sync::Arc::new(self.state);
        (
            NoiseSender {
                state: state.clone(),
                nonce: self.tx_nonce,
            },
            NoiseReceiver {
                state,
                nonce: self.rx_nonce,
            },
        )
    }
}

/// Outbound half of a split transport
pub struct NoiseSender {
    state: std::sync::Arc<StatelessTransportState>,
    nonce: u64,
}

impl NoiseSender {
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let (ciphertext, next) = encrypt_with(&self.state, self.nonce, plaintext)?;
        self.nonce = next;
        Ok(ciphertext)
    }
}

/// Inbound half of a split transport
pub struct NoiseReceiver {
    state: std::sync::Arc<StatelessTransportState>,
    nonce: u64,
}

impl NoiseReceiver {
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let (plaintext, next) = decrypt_with(&self.state, self.nonce, ciphertext)?;
        self.nonce = next;
        Ok(plaintext)
    }
}

fn encrypt_with(
    state: &StatelessTransportState,
    nonce: u64,
    plaintext: &[u8],
) -> Result<(Vec<u8>, u64), ProtocolError> {
    if plaintext.len() > MAX_PLAINTEXT {
        return Err(ProtocolError::OversizedFrame(plaintext.len()));
    }
    let next = nonce.checked_add(1).ok_or(ProtocolError::NonceExhausted)?;
    let mut buf = vec![0u8; plaintext.len() + TAG_SIZE];
    let len = state.write_message(nonce, plaintext, &mut buf)?;
    buf.truncate(len);
    Ok((buf, next))
}

fn decrypt_with(
    state: &StatelessTransportState,
    nonce: u64,
    ciphertext: &[u8],
) -> Result<(Vec<u8>, u64), ProtocolError> {
    if ciphertext.len() > MAX_CIPHERTEXT {
        return Err(ProtocolError::OversizedFrame(ciphertext.len()));
    }
    let next = nonce.checked_add(1).ok_or(ProtocolError::NonceExhausted)?;
    let mut buf = vec![0u8; ciphertext.len()];
    let len = state.read_message(nonce, ciphertext, &mut buf)?;
    buf.truncate(len);
    Ok((buf, next))
}

/// Wrap a handshake payload in its carrier frame
pub fn handshake_frame(payload: Vec<u8>) -> Frame {
    Frame {
        header: FrameHeader {
            extension_type: EXTENSION_NOISE,
            message_type: MSG_HANDSHAKE,
            length: payload.len() as u32,
        },
        payload: Bytes::from(payload),
    }
}

/// Wrap a ciphertext in its carrier frame
pub fn encrypted_frame(ciphertext: Vec<u8>) -> Frame {
    Frame {
        header: FrameHeader {
            extension_type: EXTENSION_NOISE,
            message_type: MSG_ENCRYPTED,
            length: ciphertext.len() as u32,
        },
        payload: Bytes::from(ciphertext),
    }
}

/// Parse a decrypted transport payload back into the inner mining frame
pub fn parse_inner_frame(plaintext: &[u8]) -> Result<Frame, ProtocolError> {
    let header = FrameHeader::parse(plaintext)?;
    if !header.length_in_bounds()
        || plaintext.len() != crate::v2::frame::HEADER_SIZE + header.length as usize
    {
        return Err(ProtocolError::MalformedFrame(
            "inner frame length mismatch".into(),
        ));
    }
    let payload = Bytes::copy_from_slice(&plaintext[crate::v2::frame::HEADER_SIZE..]);
    Ok(Frame { header, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v2::messages::SetupConnectionSuccess;
    use crate::v2::Message;

    /// Drive a full NX handshake in memory and return both transports
    fn handshake_pair() -> (NoiseTransport, NoiseTransport) {
        let keypair = NoiseKeypair::generate().unwrap();
        let mut initiator = NoiseSession::initiator().unwrap();
        let mut responder = NoiseSession::responder(&keypair).unwrap();

        // -> e
        let first = initiator.write_message().unwrap();
        responder.read_message(&first).unwrap();

        // <- e, ee, s, es
        let second = responder.write_message().unwrap();
        initiator.read_message(&second).unwrap();

        assert!(initiator.is_finished());
        assert!(responder.is_finished());
        (
            initiator.into_transport().unwrap(),
            responder.into_transport().unwrap(),
        )
    }

    #[test]
    fn test_handshake_then_encrypted_roundtrip() {
        let (mut initiator, mut responder) = handshake_pair();

        let message = Message::SetupConnectionSuccess(SetupConnectionSuccess {
            used_version: 2,
            flags: 0,
        });
        let plaintext = message.to_frame().encode();
        let ciphertext = responder.encrypt(&plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + 16);

        let decrypted = initiator.decrypt(&ciphertext).unwrap();
        let frame = parse_inner_frame(&decrypted).unwrap();
        let decoded = Message::decode_payload(frame.header.message_type, &frame.payload).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_tampered_ciphertext_fails_auth() {
        let (mut initiator, mut responder) = handshake_pair();
        let mut ciphertext = responder.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(initiator.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_nonces_stay_in_step_across_messages() {
        let (mut initiator, mut responder) = handshake_pair();
        for i in 0..3u8 {
            let ciphertext = responder.encrypt(&[i]).unwrap();
            assert_eq!(initiator.decrypt(&ciphertext).unwrap(), vec![i]);
        }
    }

    #[test]
    fn test_split_halves_keep_direction_nonces() {
        let (initiator, responder) = handshake_pair();
        let (mut client_tx, mut client_rx) = initiator.split();
        let (mut server_tx, mut server_rx) = responder.split();

        // Interleave both directions; each half advances independently
        for i in 0..2u8 {
            let c = client_tx.encrypt(&[i]).unwrap();
            assert_eq!(server_rx.decrypt(&c).unwrap(), vec![i]);
            let s = server_tx.encrypt(&[0x80 | i]).unwrap();
            assert_eq!(client_rx.decrypt(&s).unwrap(), vec![0x80 | i]);
        }
    }

    #[test]
    fn test_replayed_ciphertext_fails() {
        let (mut initiator, mut responder) = handshake_pair();
        let ciphertext = responder.encrypt(b"once").unwrap();
        assert!(initiator.decrypt(&ciphertext).is_ok());
        // The receive nonce has moved on; a replay cannot authenticate
        assert!(initiator.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_oversized_plaintext_rejected() {
        let (_, mut responder) = handshake_pair();
        let big = vec![0u8; MAX_PLAINTEXT + 1];
        assert!(matches!(
            responder.encrypt(&big),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_ciphertext_rejected_before_decrypt() {
        let (mut initiator, _) = handshake_pair();
        let big = vec![0u8; MAX_CIPHERTEXT + 1];
        assert!(matches!(
            initiator.decrypt(&big),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }

    #[test]
    fn test_low_order_remote_ephemeral_aborts_handshake() {
        let keypair = NoiseKeypair::generate().unwrap();
        let mut responder = NoiseSession::responder(&keypair).unwrap();

        // A forged "-> e" carrying the zero point: accepted as a message
        // (no agreement happens yet), but the ee/es agreements it forces
        // while writing the reply are all-zero and must be rejected
        responder.read_message(&[0u8; 32]).unwrap();
        assert!(responder.write_message().is_err());
    }

    #[test]
    fn test_clamp_scalar_bits() {
        let mut scalar = [0xffu8; 32];
        clamp_scalar(&mut scalar);
        assert_eq!(scalar[0] & 0b0000_0111, 0);
        assert_eq!(scalar[31] & 0b1000_0000, 0);
        assert_eq!(scalar[31] & 0b0100_0000, 0b0100_0000);
    }

    #[test]
    fn test_carrier_frames() {
        let hs = handshake_frame(vec![1, 2, 3]);
        assert_eq!(hs.header.message_type, MSG_HANDSHAKE);
        assert_eq!(hs.header.extension_type, EXTENSION_NOISE);

        let enc = encrypted_frame(vec![4, 5]);
        assert_eq!(enc.header.message_type, MSG_ENCRYPTED);
        assert_eq!(enc.header.length, 2);
    }

    #[test]
    fn test_keypair_from_hex_is_clamped() {
        let keypair = NoiseKeypair::from_private_hex(&"ff".repeat(32)).unwrap();
        assert_eq!(keypair.private[0] & 0b0000_0111, 0);
        assert_eq!(keypair.private[31] & 0b1000_0000, 0);
        assert!(keypair.public.is_none());

        assert!(NoiseKeypair::from_private_hex("abcd").is_err());
        assert!(NoiseKeypair::from_private_hex("zz").is_err());
    }
}
