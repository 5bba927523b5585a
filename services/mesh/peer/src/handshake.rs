//! Challenge-response handshake.
//!
//! Both sides run the same state machine:
//!
//! ```text
//! Hello      sent on transport connect: token, network id, advertised address
//! Check      sent once our Hello is acked and the remote Hello is accepted
//! CheckReply signature over (challenge || checker token bytes)
//! Done       sent after verifying the remote CheckReply
//! ```
//!
//! The handshake completes once the remote reply is verified, the remote
//! Done has arrived and our own Done has been acknowledged. The last
//! condition guarantees the remote routes our Done before any application
//! message we send afterwards.

use crate::error::HandshakeError;
use crate::token::{MeshToken, SIGNATURE_LENGTH};
use bytes::Bytes;
use mesh_wire::{Message, PackReader, PackWriter, TypeRegistry, Unpack, WireError};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;

/// Wire name of [`Hello`]
pub const HELLO: &str = "mesh.hello";
/// Wire name of [`Check`]
pub const CHECK: &str = "mesh.check";
/// Wire name of [`CheckReply`]
pub const CHECK_REPLY: &str = "mesh.check-reply";
/// Wire name of [`Done`]
pub const DONE: &str = "mesh.done";

/// Length of a check challenge
pub const CHALLENGE_LENGTH: usize = 32;

/// Identity announcement
#[derive(Debug, Clone)]
pub struct Hello {
    /// Sender's public token
    pub token: MeshToken,
    /// Sender's mesh network id
    pub network_id: Bytes,
    /// Address the sender wants to be reached at
    pub advertised: Option<SocketAddr>,
}

impl Message for Hello {
    fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError> {
        self.token.pack(writer);
        writer.put_bytes(&self.network_id)?;
        match self.advertised {
            Some(addr) => {
                writer.put_bool(true);
                writer.put_str(&addr.to_string())?;
            }
            None => writer.put_bool(false),
        }
        Ok(())
    }
}

impl Unpack for Hello {
    fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
        let token = MeshToken::unpack(reader)?;
        let network_id = reader.get_bytes()?;
        let advertised = if reader.get_bool()? {
            let raw = reader.get_str()?;
            let addr = raw
                .parse()
                .map_err(|_| WireError::Invalid(format!("advertised address '{}'", raw)))?;
            Some(addr)
        } else {
            None
        };
        Ok(Self {
            token,
            network_id,
            advertised,
        })
    }
}

/// Challenge to prove ownership of the announced token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Random challenge
    pub challenge: [u8; CHALLENGE_LENGTH],
}

impl Message for Check {
    fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError> {
        writer.put_fixed(&self.challenge);
        Ok(())
    }
}

impl Unpack for Check {
    fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
        Ok(Self {
            challenge: reader.get_array()?,
        })
    }
}

/// Signed answer to a [`Check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReply {
    /// Signature over challenge and checker token bytes
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl Message for CheckReply {
    fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError> {
        writer.put_fixed(&self.signature);
        Ok(())
    }
}

impl Unpack for CheckReply {
    fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
        Ok(Self {
            signature: reader.get_array()?,
        })
    }
}

/// Verification succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done;

impl Message for Done {
    fn pack(&self, _writer: &mut PackWriter) -> Result<(), WireError> {
        Ok(())
    }
}

impl Unpack for Done {
    fn unpack(_reader: &mut PackReader) -> Result<Self, WireError> {
        Ok(Done)
    }
}

/// Map the reserved handshake names; fails if any is already taken
pub fn register(registry: &mut TypeRegistry) -> Result<(), WireError> {
    registry.map::<Hello>(HELLO, false)?;
    registry.map::<Check>(CHECK, false)?;
    registry.map::<CheckReply>(CHECK_REPLY, false)?;
    registry.map::<Done>(DONE, false)?;
    Ok(())
}

/// Whether a message is one of the handshake kinds
pub fn is_handshake_message(message: &dyn Message) -> bool {
    message.is::<Hello>() || message.is::<Check>() || message.is::<CheckReply>() || message.is::<Done>()
}

/// Locally sent message whose acknowledgement advances the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acked {
    Hello,
    Done,
}

/// Work produced by the state machine
pub(crate) enum Step {
    /// Emit a message; report `ack` back once it is acknowledged
    Send {
        message: Arc<dyn Message>,
        ack: Option<Acked>,
    },
    /// Handshake finished
    Complete {
        token: MeshToken,
        advertised: Option<SocketAddr>,
    },
}

/// Per-link handshake state
pub(crate) struct Handshake {
    local: Arc<MeshToken>,
    network_id: Bytes,
    advertised: Option<SocketAddr>,
    hello_acked: bool,
    remote_hello: Option<Hello>,
    sent_check: Option<Check>,
    answered_check: bool,
    verified: bool,
    done_acked: bool,
    done_received: bool,
    completed: bool,
}

impl Handshake {
    pub(crate) fn new(local: Arc<MeshToken>, network_id: Bytes, advertised: Option<SocketAddr>) -> Self {
        Self {
            local,
            network_id,
            advertised,
            hello_acked: false,
            remote_hello: None,
            sent_check: None,
            answered_check: false,
            verified: false,
            done_acked: false,
            done_received: false,
            completed: false,
        }
    }

    /// Fresh state for a new link
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.local.clone(), self.network_id.clone(), self.advertised);
    }

    pub(crate) fn start(&mut self) -> Vec<Step> {
        let hello = Hello {
            token: self.local.public_only(),
            network_id: self.network_id.clone(),
            advertised: self.advertised,
        };
        vec![Step::Send {
            message: Arc::new(hello),
            ack: Some(Acked::Hello),
        }]
    }

    /// Remote side has verified us and said so
    pub(crate) fn is_remote_complete(&self) -> bool {
        self.verified && self.done_received
    }

    pub(crate) fn acknowledged(&mut self, acked: Acked) -> Vec<Step> {
        match acked {
            Acked::Hello => {
                self.hello_acked = true;
                self.maybe_check().into_iter().collect()
            }
            Acked::Done => {
                self.done_acked = true;
                self.maybe_complete().into_iter().collect()
            }
        }
    }

    pub(crate) fn receive(&mut self, message: &dyn Message) -> Result<Vec<Step>, HandshakeError> {
        if self.completed {
            return Err(HandshakeError::Unexpected("handshake already complete"));
        }

        if let Some(hello) = message.downcast_ref::<Hello>() {
            self.on_hello(hello)
        } else if let Some(check) = message.downcast_ref::<Check>() {
            self.on_check(check)
        } else if let Some(reply) = message.downcast_ref::<CheckReply>() {
            self.on_check_reply(reply)
        } else if message.is::<Done>() {
            self.on_done()
        } else {
            Err(HandshakeError::Unexpected("application message before handshake"))
        }
    }

    fn on_hello(&mut self, hello: &Hello) -> Result<Vec<Step>, HandshakeError> {
        if self.remote_hello.is_some() {
            return Err(HandshakeError::Unexpected("repeated hello"));
        }
        if hello.network_id != self.network_id {
            return Err(HandshakeError::NetworkMismatch);
        }
        if !hello.token.is_valid() {
            return Err(HandshakeError::InvalidToken);
        }
        if hello.token == *self.local {
            return Err(HandshakeError::SelfConnection);
        }

        self.remote_hello = Some(hello.clone());
        Ok(self.maybe_check().into_iter().collect())
    }

    fn on_check(&mut self, check: &Check) -> Result<Vec<Step>, HandshakeError> {
        let remote = self
            .remote_hello
            .as_ref()
            .ok_or(HandshakeError::Unexpected("check before hello"))?;
        if self.answered_check {
            return Err(HandshakeError::Unexpected("repeated check"));
        }

        let payload = challenge_payload(&check.challenge, &remote.token);
        let signature = self.local.sign(&payload).map_err(|_| HandshakeError::Signing)?;
        self.answered_check = true;

        Ok(vec![Step::Send {
            message: Arc::new(CheckReply { signature }),
            ack: None,
        }])
    }

    fn on_check_reply(&mut self, reply: &CheckReply) -> Result<Vec<Step>, HandshakeError> {
        let check = self
            .sent_check
            .as_ref()
            .ok_or(HandshakeError::Unexpected("check reply without check"))?;
        if self.verified {
            return Err(HandshakeError::Unexpected("repeated check reply"));
        }
        let remote = self
            .remote_hello
            .as_ref()
            .ok_or(HandshakeError::Unexpected("check reply before hello"))?;

        let payload = challenge_payload(&check.challenge, &self.local);
        if !remote.token.verify(&reply.signature, &payload) {
            return Err(HandshakeError::VerificationFailed);
        }
        self.verified = true;

        Ok(vec![Step::Send {
            message: Arc::new(Done),
            ack: Some(Acked::Done),
        }])
    }

    fn on_done(&mut self) -> Result<Vec<Step>, HandshakeError> {
        if !self.answered_check {
            return Err(HandshakeError::Unexpected("done before check reply"));
        }
        if self.done_received {
            return Err(HandshakeError::Unexpected("repeated done"));
        }
        self.done_received = true;
        Ok(self.maybe_complete().into_iter().collect())
    }

    fn maybe_check(&mut self) -> Option<Step> {
        if !self.hello_acked || self.remote_hello.is_none() || self.sent_check.is_some() {
            return None;
        }
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut challenge);
        let check = Check { challenge };
        self.sent_check = Some(check.clone());
        Some(Step::Send {
            message: Arc::new(check),
            ack: None,
        })
    }

    fn maybe_complete(&mut self) -> Option<Step> {
        if self.completed || !(self.verified && self.done_received && self.done_acked) {
            return None;
        }
        let remote = self.remote_hello.as_ref()?;
        self.completed = true;
        Some(Step::Complete {
            token: remote.token.public_only(),
            advertised: remote.advertised,
        })
    }
}

fn challenge_payload(challenge: &[u8; CHALLENGE_LENGTH], checker: &MeshToken) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CHALLENGE_LENGTH + crate::token::PACKED_TOKEN_LENGTH);
    payload.extend_from_slice(challenge);
    payload.extend_from_slice(&checker.to_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::PackConfig;
    use std::collections::VecDeque;

    fn node(network: &'static [u8], advertised: Option<&str>) -> Handshake {
        Handshake::new(
            Arc::new(MeshToken::generate()),
            Bytes::from_static(network),
            advertised.map(|addr| addr.parse().unwrap()),
        )
    }

    /// Deliver every step between two nodes, acknowledging each send
    fn run(nodes: &mut [Handshake; 2]) -> Result<[Option<(MeshToken, Option<SocketAddr>)>; 2], HandshakeError> {
        let mut queue = VecDeque::new();
        for (index, node) in nodes.iter_mut().enumerate() {
            for step in node.start() {
                queue.push_back((index, step));
            }
        }

        let mut completed = [None, None];
        while let Some((from, step)) = queue.pop_front() {
            match step {
                Step::Send { message, ack } => {
                    let to = 1 - from;
                    for next in nodes[to].receive(message.as_ref())? {
                        queue.push_back((to, next));
                    }
                    if let Some(ack) = ack {
                        for next in nodes[from].acknowledged(ack) {
                            queue.push_back((from, next));
                        }
                    }
                }
                Step::Complete { token, advertised } => completed[from] = Some((token, advertised)),
            }
        }
        Ok(completed)
    }

    fn sent(steps: Vec<Step>) -> Arc<dyn Message> {
        match steps.into_iter().next() {
            Some(Step::Send { message, .. }) => message,
            _ => panic!("expected a send step"),
        }
    }

    #[test]
    fn test_successful_handshake() {
        let mut nodes = [node(b"net", Some("10.0.0.1:7000")), node(b"net", None)];
        let tokens = [nodes[0].local.clone(), nodes[1].local.clone()];

        let completed = run(&mut nodes).unwrap();
        let (a_sees, a_advertised) = completed[0].clone().unwrap();
        let (b_sees, b_advertised) = completed[1].clone().unwrap();

        assert_eq!(a_sees, *tokens[1]);
        assert_eq!(b_sees, *tokens[0]);
        assert!(!a_sees.has_private_key());
        assert_eq!(a_advertised, None);
        assert_eq!(b_advertised, Some("10.0.0.1:7000".parse().unwrap()));
        assert!(nodes[0].is_remote_complete());
    }

    #[test]
    fn test_network_mismatch() {
        let mut nodes = [node(b"alpha", None), node(b"beta", None)];
        assert_eq!(run(&mut nodes).err(), Some(HandshakeError::NetworkMismatch));
    }

    #[test]
    fn test_tampered_reply_fails_verification() {
        let mut a = node(b"net", None);
        let mut b = node(b"net", None);

        let hello_a = sent(a.start());
        let hello_b = sent(b.start());
        assert!(b.receive(hello_a.as_ref()).unwrap().is_empty());
        assert!(a.acknowledged(Acked::Hello).is_empty());
        let check_a = sent(a.receive(hello_b.as_ref()).unwrap());

        let reply = sent(b.receive(check_a.as_ref()).unwrap());
        let mut forged = reply.downcast_ref::<CheckReply>().unwrap().clone();
        forged.signature[0] ^= 0xff;

        assert_eq!(
            a.receive(&forged).err(),
            Some(HandshakeError::VerificationFailed)
        );
        assert!(!a.is_remote_complete());
    }

    #[test]
    fn test_reply_signed_for_another_checker_fails() {
        let mut a = node(b"net", None);
        let mut b = node(b"net", None);

        let hello_b = sent(b.start());
        a.start();
        a.acknowledged(Acked::Hello);
        let check_a = sent(a.receive(hello_b.as_ref()).unwrap());
        let check_a = check_a.downcast_ref::<Check>().unwrap();

        let stranger = MeshToken::generate();
        let payload = challenge_payload(&check_a.challenge, &stranger);
        let signature = b.local.sign(&payload).unwrap();

        assert_eq!(
            a.receive(&CheckReply { signature }).err(),
            Some(HandshakeError::VerificationFailed)
        );
    }

    #[test]
    fn test_out_of_order_messages() {
        let mut a = node(b"net", None);
        a.start();

        assert_eq!(
            a.receive(&Check { challenge: [1; CHALLENGE_LENGTH] }).err(),
            Some(HandshakeError::Unexpected("check before hello"))
        );
        assert_eq!(
            a.receive(&CheckReply { signature: [0; SIGNATURE_LENGTH] }).err(),
            Some(HandshakeError::Unexpected("check reply without check"))
        );
        assert_eq!(
            a.receive(&Done).err(),
            Some(HandshakeError::Unexpected("done before check reply"))
        );
    }

    #[test]
    fn test_repeated_hello_and_self_connection() {
        let mut a = node(b"net", None);
        let mut b = node(b"net", None);
        let hello_b = sent(b.start());

        a.receive(hello_b.as_ref()).unwrap();
        assert_eq!(
            a.receive(hello_b.as_ref()).err(),
            Some(HandshakeError::Unexpected("repeated hello"))
        );

        let mut own = node(b"net", None);
        let hello_own = sent(own.start());
        assert_eq!(
            own.receive(hello_own.as_ref()).err(),
            Some(HandshakeError::SelfConnection)
        );
    }

    #[test]
    fn test_invalid_token_rejected() {
        let mut a = node(b"net", None);
        let real = MeshToken::generate();
        let hello = Hello {
            token: MeshToken::from_parts([0; 32], *real.public_key()),
            network_id: Bytes::from_static(b"net"),
            advertised: None,
        };
        assert_eq!(a.receive(&hello).err(), Some(HandshakeError::InvalidToken));
    }

    #[test]
    fn test_hello_wire_round_trip_with_advertisement() {
        let mut registry = TypeRegistry::new();
        register(&mut registry).unwrap();
        assert!(register(&mut registry).is_err());

        let hello = Hello {
            token: MeshToken::generate().public_only(),
            network_id: Bytes::from_static(b"mesh-1"),
            advertised: Some("[::1]:9000".parse().unwrap()),
        };
        let mut writer = PackWriter::new(PackConfig::default());
        hello.pack(&mut writer).unwrap();
        let mut reader = PackReader::new(writer.into_bytes(), PackConfig::default());
        let decoded = registry.decode(HELLO, &mut reader).unwrap();
        let decoded = decoded.downcast_ref::<Hello>().unwrap();

        assert_eq!(decoded.token, hello.token);
        assert_eq!(decoded.network_id, hello.network_id);
        assert_eq!(decoded.advertised, hello.advertised);
        assert!(is_handshake_message(&Done));
    }
}
