//! Double Ratchet connection state for one exchange.
//!
//! State separation follows the Signal construction:
//!   root key     - advanced on every DH ratchet step
//!   sending ck   - advanced per outbound message
//!   receiving ck - advanced per inbound message
//!   message key  - derived from a chain key, used once, then zeroized
//!
//! A DH ratchet step is driven from both directions: the sender rotates its
//! ratchet keypair when its chain hits the policy's message budget or age
//! limit, and the receiver mirrors the rotation when an envelope arrives
//! carrying an unseen ratchet public key. Out-of-order envelopes inside the
//! policy window are served from a bounded skipped-key cache.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore as _;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::IdentityKeystore;
use crate::kdf;

/// AES-256-GCM authentication tag length.
const TAG_LEN: usize = 16;
/// Hard bound on the skipped-key cache, independent of policy windows.
const SKIPPED_CACHE_BOUND: usize = 128;
/// X3DH domain-separation pad prepended to the concatenated DH outputs.
const X3DH_PAD: [u8; 32] = [0xFF; 32];

/// Policy selector for ratchet configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    /// Default request/response exchange; state is persisted.
    EphemeralConnect,
    /// Long-lived inbound stream; aggressive DH cadence, memory-only.
    ServerStreaming,
}

/// Tunable ratchet behavior per exchange type.
#[derive(Debug, Clone, Copy)]
pub struct RatchetPolicy {
    /// Rotate the sending ratchet keypair after this many messages.
    pub dh_ratchet_every_n_messages: u32,
    /// Rotate the sending ratchet keypair when the chain is older than this.
    pub max_chain_age: Duration,
    /// Largest tolerated receive-side index gap; also the skip window.
    pub max_messages_without_ratchet: u32,
    /// Whether ratchet state survives the process.
    pub persistent: bool,
}

impl RatchetPolicy {
    pub fn for_exchange(exchange_type: ExchangeType) -> Self {
        match exchange_type {
            ExchangeType::EphemeralConnect => Self {
                dh_ratchet_every_n_messages: 10,
                max_chain_age: Duration::from_secs(600),
                max_messages_without_ratchet: 64,
                persistent: true,
            },
            ExchangeType::ServerStreaming => Self {
                dh_ratchet_every_n_messages: 20,
                max_chain_age: Duration::from_secs(300),
                max_messages_without_ratchet: 100,
                persistent: false,
            },
        }
    }
}

/// The remote side's handshake material, as seen by the ratchet.
#[derive(Debug, Clone)]
pub struct PeerHandshake {
    pub identity_x25519: [u8; 32],
    pub identity_ed25519: [u8; 32],
    pub signed_prekey: [u8; 32],
    pub signed_prekey_signature: [u8; 64],
    pub one_time_prekey: Option<[u8; 32]>,
    pub initial_dh: [u8; 32],
}

/// One sealed message as produced/consumed by the ratchet.
///
/// `dh_public` is the sender's current ratchet key; `ratchet_index` is the
/// message's position in that sending chain.
#[derive(Debug, Clone)]
pub struct RatchetMessage {
    pub dh_public: [u8; 32],
    pub ratchet_index: u32,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Outcome of sealing one plaintext.
#[derive(Debug)]
pub struct OutboundResult {
    pub message: RatchetMessage,
    /// True when this send performed a DH ratchet step.
    pub ratcheted: bool,
    /// Sending chain index after the send.
    pub new_index: u32,
}

/// Outcome of opening one envelope.
#[derive(Debug)]
pub struct InboundResult {
    pub plaintext: Vec<u8>,
    /// True when this receive performed a DH ratchet step.
    pub ratcheted: bool,
    /// True when the message key came from the skipped-key cache.
    pub used_skipped_key: bool,
    /// Receiving chain index after the receive.
    pub new_index: u32,
}

struct SendingChain {
    chain_key: [u8; 32],
    index: u32,
    dh_secret: StaticSecret,
    dh_public: X25519Public,
    seeded: bool,
}

struct ReceivingChain {
    chain_key: [u8; 32],
    index: u32,
    remote_dh: Option<[u8; 32]>,
    seeded: bool,
}

/// Per-exchange Double Ratchet state machine.
pub struct RatchetConnection {
    connect_id: u32,
    exchange_type: ExchangeType,
    policy: RatchetPolicy,
    root_key: [u8; 32],
    sending: SendingChain,
    receiving: ReceivingChain,
    prev_sending_len: u32,
    /// Remote ratchet key superseded by the most recent receive ratchet.
    /// Envelopes still carrying it are stragglers, never a new ratchet.
    previous_remote_dh: Option<[u8; 32]>,
    skipped: HashMap<([u8; 32], u32), [u8; 32]>,
    skipped_order: VecDeque<([u8; 32], u32)>,
    last_ratchet_at: Instant,
    established: bool,
}

impl Drop for RatchetConnection {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.sending.chain_key.zeroize();
        self.receiving.chain_key.zeroize();
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

impl RatchetConnection {
    /// Create an unconnected ratchet with a fresh initial DH keypair.
    pub fn new(connect_id: u32, exchange_type: ExchangeType) -> Self {
        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let dh_public = X25519Public::from(&dh_secret);
        Self {
            connect_id,
            exchange_type,
            policy: RatchetPolicy::for_exchange(exchange_type),
            root_key: [0u8; 32],
            sending: SendingChain {
                chain_key: [0u8; 32],
                index: 0,
                dh_secret,
                dh_public,
                seeded: false,
            },
            receiving: ReceivingChain {
                chain_key: [0u8; 32],
                index: 0,
                remote_dh: None,
                seeded: false,
            },
            prev_sending_len: 0,
            previous_remote_dh: None,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
            last_ratchet_at: Instant::now(),
            established: false,
        }
    }

    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Local initial DH public key, advertised in the handshake.
    pub fn local_dh_public(&self) -> [u8; 32] {
        *self.sending.dh_public.as_bytes()
    }

    pub fn sending_index(&self) -> u32 {
        self.sending.index
    }

    pub fn receiving_index(&self) -> u32 {
        self.receiving.index
    }

    // ── Exchange completion ──────────────────────────────────────────────

    /// Complete the exchange as the initiator: triple DH against the peer's
    /// bundle, then seed the sending chain against the peer's initial DH key.
    pub fn complete_exchange(
        &mut self,
        keystore: &IdentityKeystore,
        peer: &PeerHandshake,
    ) -> Result<(), CryptoError> {
        let root = self.agree_initiator(keystore, peer)?;
        self.finish_exchange(root, peer)
    }

    /// Complete the exchange with an externally supplied root key
    /// (master-key-authenticated path); no DH agreement is performed.
    pub fn complete_authenticated_exchange(
        &mut self,
        peer: &PeerHandshake,
        initial_root_key: [u8; 32],
    ) -> Result<(), CryptoError> {
        verify_signed_prekey(peer)?;
        self.finish_exchange(initial_root_key, peer)
    }

    /// Complete the exchange as the responder. Mirrors the initiator's DH
    /// set; used by loopback peers in tests and by streaming endpoints.
    pub fn accept_exchange(
        &mut self,
        keystore: &IdentityKeystore,
        peer: &PeerHandshake,
        our_one_time_prekey: Option<&StaticSecret>,
    ) -> Result<(), CryptoError> {
        let root = self.agree_responder(keystore, peer, our_one_time_prekey)?;
        self.finish_accept(root, peer)
    }

    /// Responder counterpart of [`complete_authenticated_exchange`]: take the
    /// supplied root and mirror the initiator's chain seeding.
    ///
    /// [`complete_authenticated_exchange`]: Self::complete_authenticated_exchange
    pub fn accept_authenticated_exchange(
        &mut self,
        peer: &PeerHandshake,
        initial_root_key: [u8; 32],
    ) -> Result<(), CryptoError> {
        self.finish_accept(initial_root_key, peer)
    }

    fn finish_accept(&mut self, root: [u8; 32], peer: &PeerHandshake) -> Result<(), CryptoError> {
        if self.established {
            return Err(CryptoError::ExchangeState("exchange already completed".into()));
        }
        self.root_key = root;
        self.receiving.remote_dh = Some(peer.initial_dh);
        // The initiator seeds its sending chain immediately; mirror it here
        // as our receiving chain so the first inbound message decrypts.
        let shared = self
            .sending
            .dh_secret
            .diffie_hellman(&X25519Public::from(peer.initial_dh));
        let (new_root, chain_key) = kdf::advance_root(&self.root_key, shared.as_bytes())?;
        self.root_key = new_root;
        self.receiving.chain_key = chain_key;
        self.receiving.index = 0;
        self.receiving.seeded = true;
        self.established = true;
        self.last_ratchet_at = Instant::now();
        Ok(())
    }

    fn finish_exchange(
        &mut self,
        root: [u8; 32],
        peer: &PeerHandshake,
    ) -> Result<(), CryptoError> {
        if self.established {
            return Err(CryptoError::ExchangeState("exchange already completed".into()));
        }
        self.root_key = root;
        self.receiving.remote_dh = Some(peer.initial_dh);

        // Seed the sending chain against the peer's advertised DH key.
        let shared = self
            .sending
            .dh_secret
            .diffie_hellman(&X25519Public::from(peer.initial_dh));
        let (new_root, chain_key) = kdf::advance_root(&self.root_key, shared.as_bytes())?;
        self.root_key = new_root;
        self.sending.chain_key = chain_key;
        self.sending.index = 0;
        self.sending.seeded = true;
        self.established = true;
        self.last_ratchet_at = Instant::now();

        tracing::debug!(
            connect_id = self.connect_id,
            remote_dh = %hex::encode(peer.initial_dh),
            "exchange completed"
        );
        Ok(())
    }

    fn agree_initiator(
        &self,
        keystore: &IdentityKeystore,
        peer: &PeerHandshake,
    ) -> Result<[u8; 32], CryptoError> {
        verify_signed_prekey(peer)?;

        let peer_identity = X25519Public::from(peer.identity_x25519);
        let peer_spk = X25519Public::from(peer.signed_prekey);

        let dh1 = keystore.identity_x25519_secret().diffie_hellman(&peer_spk);
        let dh2 = self.sending.dh_secret.diffie_hellman(&peer_identity);
        let dh3 = self.sending.dh_secret.diffie_hellman(&peer_spk);

        let mut ikm = Vec::with_capacity(32 * 5);
        ikm.extend_from_slice(&X3DH_PAD);
        ikm.extend_from_slice(dh1.as_bytes());
        ikm.extend_from_slice(dh2.as_bytes());
        ikm.extend_from_slice(dh3.as_bytes());
        if let Some(opk) = peer.one_time_prekey {
            let dh4 = self.sending.dh_secret.diffie_hellman(&X25519Public::from(opk));
            ikm.extend_from_slice(dh4.as_bytes());
        }

        let root = kdf::derive_key32(&ikm, kdf::ROOT_KEY_INFO)?;
        ikm.zeroize();
        Ok(root)
    }

    fn agree_responder(
        &self,
        keystore: &IdentityKeystore,
        peer: &PeerHandshake,
        our_one_time_prekey: Option<&StaticSecret>,
    ) -> Result<[u8; 32], CryptoError> {
        verify_signed_prekey(peer)?;

        let peer_identity = X25519Public::from(peer.identity_x25519);
        let peer_dh = X25519Public::from(peer.initial_dh);

        let dh1 = keystore.signed_prekey_secret().diffie_hellman(&peer_identity);
        let dh2 = keystore.identity_x25519_secret().diffie_hellman(&peer_dh);
        let dh3 = keystore.signed_prekey_secret().diffie_hellman(&peer_dh);

        let mut ikm = Vec::with_capacity(32 * 5);
        ikm.extend_from_slice(&X3DH_PAD);
        ikm.extend_from_slice(dh1.as_bytes());
        ikm.extend_from_slice(dh2.as_bytes());
        ikm.extend_from_slice(dh3.as_bytes());
        if let Some(opk) = our_one_time_prekey {
            let dh4 = opk.diffie_hellman(&peer_dh);
            ikm.extend_from_slice(dh4.as_bytes());
        }

        let root = kdf::derive_key32(&ikm, kdf::ROOT_KEY_INFO)?;
        ikm.zeroize();
        Ok(root)
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Seal one plaintext, advancing the sending chain and performing a DH
    /// ratchet step when the policy demands one.
    pub fn produce_outbound(&mut self, plaintext: &[u8]) -> Result<OutboundResult, CryptoError> {
        if !self.established {
            return Err(CryptoError::ExchangeState("exchange not completed".into()));
        }

        let mut ratcheted = false;
        if self.needs_sending_ratchet() {
            self.sending_ratchet()?;
            ratcheted = true;
        }

        let (next_ck, mut mk) = kdf::chain_step(&self.sending.chain_key)?;
        self.sending.chain_key = next_ck;

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let index = self.sending.index;
        let dh_public = *self.sending.dh_public.as_bytes();

        let (ciphertext, tag) = seal(&mk, &nonce, plaintext, &aad(&dh_public, index))?;
        mk.zeroize();

        self.sending.index += 1;
        Ok(OutboundResult {
            message: RatchetMessage { dh_public, ratchet_index: index, nonce, ciphertext, tag },
            ratcheted,
            new_index: self.sending.index,
        })
    }

    fn needs_sending_ratchet(&self) -> bool {
        if !self.sending.seeded {
            return true;
        }
        self.sending.index >= self.policy.dh_ratchet_every_n_messages
            || self.last_ratchet_at.elapsed() > self.policy.max_chain_age
    }

    fn sending_ratchet(&mut self) -> Result<(), CryptoError> {
        let remote = self.receiving.remote_dh.ok_or_else(|| {
            CryptoError::ExchangeState("no remote ratchet key for sending ratchet".into())
        })?;

        let new_secret = StaticSecret::random_from_rng(OsRng);
        let new_public = X25519Public::from(&new_secret);
        let shared = new_secret.diffie_hellman(&X25519Public::from(remote));
        let (new_root, chain_key) = kdf::advance_root(&self.root_key, shared.as_bytes())?;

        self.root_key = new_root;
        self.prev_sending_len = self.sending.index;
        self.sending = SendingChain {
            chain_key,
            index: 0,
            dh_secret: new_secret,
            dh_public: new_public,
            seeded: true,
        };
        self.last_ratchet_at = Instant::now();
        tracing::trace!(connect_id = self.connect_id, "sending DH ratchet");
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Open one envelope. May mirror a remote DH ratchet, may consume a
    /// skipped-key entry, may cache keys for an index gap inside the window.
    pub fn process_inbound(&mut self, message: &RatchetMessage) -> Result<InboundResult, CryptoError> {
        if !self.established {
            return Err(CryptoError::ExchangeState("exchange not completed".into()));
        }

        // Skipped key first: out-of-order delivery inside the window.
        let cache_key = (message.dh_public, message.ratchet_index);
        if let Some(mut mk) = self.take_skipped(&cache_key) {
            let plaintext = open(&mk, &message.nonce, &message.ciphertext, &message.tag,
                &aad(&message.dh_public, message.ratchet_index))?;
            mk.zeroize();
            return Ok(InboundResult {
                plaintext,
                ratcheted: false,
                used_skipped_key: true,
                new_index: self.receiving.index,
            });
        }

        let mut ratcheted = false;
        if self.receiving.remote_dh != Some(message.dh_public) {
            if self.previous_remote_dh == Some(message.dh_public) {
                // A straggler from the superseded chain whose key was
                // evicted or never cached: unrecoverable.
                return Err(CryptoError::Decryption(
                    "message key no longer available for superseded chain".into(),
                ));
            }
            self.receiving_ratchet(message.dh_public)?;
            ratcheted = true;
        }

        if message.ratchet_index < self.receiving.index {
            return Err(CryptoError::Decryption(format!(
                "message key {} already consumed (chain at {})",
                message.ratchet_index, self.receiving.index
            )));
        }
        self.skip_to(message.dh_public, message.ratchet_index)?;

        let (next_ck, mut mk) = kdf::chain_step(&self.receiving.chain_key)?;
        self.receiving.chain_key = next_ck;
        let plaintext = open(&mk, &message.nonce, &message.ciphertext, &message.tag,
            &aad(&message.dh_public, message.ratchet_index))?;
        mk.zeroize();
        self.receiving.index = message.ratchet_index + 1;

        Ok(InboundResult {
            plaintext,
            ratcheted,
            used_skipped_key: false,
            new_index: self.receiving.index,
        })
    }

    fn receiving_ratchet(&mut self, new_remote: [u8; 32]) -> Result<(), CryptoError> {
        let shared = self
            .sending
            .dh_secret
            .diffie_hellman(&X25519Public::from(new_remote));
        let (new_root, chain_key) = kdf::advance_root(&self.root_key, shared.as_bytes())?;

        self.root_key = new_root;
        self.previous_remote_dh = self.receiving.remote_dh;
        self.receiving = ReceivingChain {
            chain_key,
            index: 0,
            remote_dh: Some(new_remote),
            seeded: true,
        };
        tracing::trace!(
            connect_id = self.connect_id,
            remote_dh = %hex::encode(new_remote),
            "receiving DH ratchet"
        );
        Ok(())
    }

    /// Derive and cache message keys from the current receiving index up to
    /// (but not including) `until`.
    fn skip_to(&mut self, chain_dh: [u8; 32], until: u32) -> Result<(), CryptoError> {
        let gap = until.saturating_sub(self.receiving.index);
        if gap > self.policy.max_messages_without_ratchet {
            return Err(CryptoError::ChainOverrun(format!(
                "gap of {gap} exceeds window {}",
                self.policy.max_messages_without_ratchet
            )));
        }
        while self.receiving.index < until {
            let (next_ck, mk) = kdf::chain_step(&self.receiving.chain_key)?;
            self.receiving.chain_key = next_ck;
            self.insert_skipped((chain_dh, self.receiving.index), mk);
            self.receiving.index += 1;
        }
        Ok(())
    }

    fn insert_skipped(&mut self, key: ([u8; 32], u32), mk: [u8; 32]) {
        if self.skipped.insert(key, mk).is_none() {
            self.skipped_order.push_back(key);
        }
        // Oldest entries fall out under pressure; those messages become
        // permanently undecryptable.
        while self.skipped.len() > SKIPPED_CACHE_BOUND {
            if let Some(oldest) = self.skipped_order.pop_front() {
                if let Some(mut dropped) = self.skipped.remove(&oldest) {
                    dropped.zeroize();
                }
            }
        }
    }

    fn take_skipped(&mut self, key: &([u8; 32], u32)) -> Option<[u8; 32]> {
        let mk = self.skipped.remove(key)?;
        self.skipped_order.retain(|k| k != key);
        Some(mk)
    }

    // ── Restore reconciliation ───────────────────────────────────────────

    /// Reconcile chain counters with the server's view after a restore.
    ///
    /// `server_sending_len` is the server's sending chain (our receiving
    /// side); `server_receiving_len` is the server's receiving chain (our
    /// sending side). Local chains are fast-forwarded when behind; in-flight
    /// receive keys are cached so stragglers still decrypt. Divergence
    /// beyond the policy window fails. Returns (sending_len, receiving_len)
    /// after reconciliation.
    pub fn sync_with_remote(
        &mut self,
        server_sending_len: u32,
        server_receiving_len: u32,
    ) -> Result<(u32, u32), CryptoError> {
        if !self.established {
            return Err(CryptoError::ExchangeState("exchange not completed".into()));
        }
        let window = self.policy.max_messages_without_ratchet;
        let recv_gap = server_sending_len.abs_diff(self.receiving.index);
        let send_gap = server_receiving_len.abs_diff(self.sending.index);
        if recv_gap > window || send_gap > window {
            return Err(CryptoError::SessionValidation(format!(
                "chain divergence recv={recv_gap} send={send_gap} exceeds window {window}"
            )));
        }

        if let Some(remote) = self.receiving.remote_dh {
            if self.receiving.seeded {
                self.skip_to(remote, server_sending_len.max(self.receiving.index))?;
            }
        }
        while self.sending.index < server_receiving_len {
            let (next_ck, mut mk) = kdf::chain_step(&self.sending.chain_key)?;
            self.sending.chain_key = next_ck;
            mk.zeroize();
            self.sending.index += 1;
        }

        tracing::debug!(
            connect_id = self.connect_id,
            sending_len = self.sending.index,
            receiving_len = self.receiving.index,
            "chains synchronized with server"
        );
        Ok((self.sending.index, self.receiving.index))
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Snapshot the ratchet into a serializable record.
    pub fn to_state(&self) -> RatchetStateRecord {
        RatchetStateRecord {
            root_key: self.root_key,
            sending_chain_key: self.sending.chain_key,
            sending_index: self.sending.index,
            sending_dh_secret: self.sending.dh_secret.to_bytes(),
            sending_seeded: self.sending.seeded,
            receiving_chain_key: self.receiving.chain_key,
            receiving_index: self.receiving.index,
            remote_dh: self.receiving.remote_dh,
            receiving_seeded: self.receiving.seeded,
            prev_sending_len: self.prev_sending_len,
            previous_remote_dh: self.previous_remote_dh,
            skipped: self
                .skipped_order
                .iter()
                .filter_map(|k| self.skipped.get(k).map(|mk| SkippedKeyRecord {
                    dh_public: k.0,
                    index: k.1,
                    message_key: *mk,
                }))
                .collect(),
            established: self.established,
        }
    }

    /// Rebuild a ratchet from a persisted record. The chain-age clock
    /// restarts, so the first send after a restore may ratchet early.
    pub fn from_state(
        connect_id: u32,
        exchange_type: ExchangeType,
        record: &RatchetStateRecord,
    ) -> Self {
        let dh_secret = StaticSecret::from(record.sending_dh_secret);
        let dh_public = X25519Public::from(&dh_secret);
        let mut skipped = HashMap::new();
        let mut skipped_order = VecDeque::new();
        for entry in &record.skipped {
            let key = (entry.dh_public, entry.index);
            if skipped.insert(key, entry.message_key).is_none() {
                skipped_order.push_back(key);
            }
        }
        Self {
            connect_id,
            exchange_type,
            policy: RatchetPolicy::for_exchange(exchange_type),
            root_key: record.root_key,
            sending: SendingChain {
                chain_key: record.sending_chain_key,
                index: record.sending_index,
                dh_secret,
                dh_public,
                seeded: record.sending_seeded,
            },
            receiving: ReceivingChain {
                chain_key: record.receiving_chain_key,
                index: record.receiving_index,
                remote_dh: record.remote_dh,
                seeded: record.receiving_seeded,
            },
            prev_sending_len: record.prev_sending_len,
            previous_remote_dh: record.previous_remote_dh,
            skipped,
            skipped_order,
            last_ratchet_at: Instant::now(),
            established: record.established,
        }
    }
}

/// Serializable ratchet state. Secret fields are raw; sealing is the storage
/// layer's contract.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RatchetStateRecord {
    pub root_key: [u8; 32],
    pub sending_chain_key: [u8; 32],
    pub sending_index: u32,
    pub sending_dh_secret: [u8; 32],
    pub sending_seeded: bool,
    pub receiving_chain_key: [u8; 32],
    pub receiving_index: u32,
    pub remote_dh: Option<[u8; 32]>,
    pub receiving_seeded: bool,
    pub prev_sending_len: u32,
    pub previous_remote_dh: Option<[u8; 32]>,
    pub skipped: Vec<SkippedKeyRecord>,
    pub established: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SkippedKeyRecord {
    pub dh_public: [u8; 32],
    pub index: u32,
    pub message_key: [u8; 32],
}

fn verify_signed_prekey(peer: &PeerHandshake) -> Result<(), CryptoError> {
    IdentityKeystore::verify(
        &peer.identity_ed25519,
        &peer.signed_prekey,
        &peer.signed_prekey_signature,
    )
    .map_err(|_| CryptoError::InvalidKey("peer signed prekey signature rejected".into()))
}

fn aad(dh_public: &[u8; 32], index: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(36);
    out.extend_from_slice(dh_public);
    out.extend_from_slice(&index.to_be_bytes());
    out
}

fn seal(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    if sealed.len() < TAG_LEN {
        return Err(CryptoError::Encryption("ciphertext shorter than tag".into()));
    }
    let tag_start = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);
    Ok((sealed, tag))
}

fn open(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: &sealed, aad })
        .map_err(|e| CryptoError::Decryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_for(
        keystore: &IdentityKeystore,
        connection: &RatchetConnection,
    ) -> PeerHandshake {
        let bundle = keystore.public_bundle();
        PeerHandshake {
            identity_x25519: bundle.identity_x25519,
            identity_ed25519: bundle.identity_ed25519,
            signed_prekey: bundle.signed_prekey,
            signed_prekey_signature: bundle.signed_prekey_signature,
            one_time_prekey: None,
            initial_dh: connection.local_dh_public(),
        }
    }

    fn connected_pair() -> (IdentityKeystore, RatchetConnection, IdentityKeystore, RatchetConnection) {
        let client_keys = IdentityKeystore::create(1).unwrap();
        let server_keys = IdentityKeystore::create(1).unwrap();
        let mut client = RatchetConnection::new(42, ExchangeType::EphemeralConnect);
        let mut server = RatchetConnection::new(42, ExchangeType::EphemeralConnect);

        let server_handshake = handshake_for(&server_keys, &server);
        let client_handshake = handshake_for(&client_keys, &client);

        client.complete_exchange(&client_keys, &server_handshake).unwrap();
        server.accept_exchange(&server_keys, &client_handshake, None).unwrap();
        (client_keys, client, server_keys, server)
    }

    #[test]
    fn in_order_roundtrip_advances_indices() {
        let (_, mut client, _, mut server) = connected_pair();

        for i in 0..5u32 {
            let payload = format!("request {i}").into_bytes();
            let before = client.sending_index();
            let out = client.produce_outbound(&payload).unwrap();
            assert_eq!(out.new_index, before + 1);

            let inbound = server.process_inbound(&out.message).unwrap();
            assert_eq!(inbound.plaintext, payload);
            assert!(!inbound.used_skipped_key);
        }
        assert_eq!(server.receiving_index(), 5);
    }

    #[test]
    fn bidirectional_traffic_ratchets() {
        let (_, mut client, _, mut server) = connected_pair();

        let out = client.produce_outbound(b"hello").unwrap();
        server.process_inbound(&out.message).unwrap();

        // Server's first send performs its initial sending ratchet.
        let reply = server.produce_outbound(b"world").unwrap();
        assert!(reply.ratcheted);
        let inbound = client.process_inbound(&reply.message).unwrap();
        assert!(inbound.ratcheted);
        assert_eq!(inbound.plaintext, b"world");

        // And traffic keeps flowing both ways afterwards.
        let out2 = client.produce_outbound(b"again").unwrap();
        assert_eq!(server.process_inbound(&out2.message).unwrap().plaintext, b"again");
    }

    #[test]
    fn reorder_within_window_succeeds() {
        let (_, mut client, _, mut server) = connected_pair();

        let envelopes: Vec<_> = (0..5u32)
            .map(|i| (i, client.produce_outbound(format!("m{i}").into_bytes().as_slice()).unwrap().message))
            .collect();

        // Deliver as e1, e0, e4, e2, e3.
        for &pos in &[1usize, 0, 4, 2, 3] {
            let (i, ref msg) = envelopes[pos];
            let inbound = server.process_inbound(msg).unwrap();
            assert_eq!(inbound.plaintext, format!("m{i}").into_bytes());
        }
        assert_eq!(server.receiving_index(), 5);
    }

    #[test]
    fn gap_beyond_window_is_chain_overrun() {
        let (_, mut client, _, mut server) = connected_pair();
        let window = RatchetPolicy::for_exchange(ExchangeType::EphemeralConnect)
            .max_messages_without_ratchet;

        // A forged index far past the window is rejected before any key
        // derivation happens.
        let mut forged = client.produce_outbound(b"x").unwrap().message;
        forged.ratchet_index = window + 1;
        let err = server.process_inbound(&forged).unwrap_err();
        assert!(matches!(err, CryptoError::ChainOverrun(_)));

        // The in-window original still decrypts afterwards.
        let honest = client.produce_outbound(b"y").unwrap().message;
        assert_eq!(server.process_inbound(&honest).unwrap().plaintext, b"y");
    }

    #[test]
    fn skipped_key_is_consumed_once() {
        let (_, mut client, _, mut server) = connected_pair();

        let e0 = client.produce_outbound(b"zero").unwrap().message;
        let e1 = client.produce_outbound(b"one").unwrap().message;

        server.process_inbound(&e1).unwrap();
        let first = server.process_inbound(&e0).unwrap();
        assert!(first.used_skipped_key);

        // Replay of the same envelope fails: the key is gone.
        assert!(server.process_inbound(&e0).is_err());
    }

    #[test]
    fn dh_ratchet_triggers_on_message_budget() {
        let (_, mut client, _, mut server) = connected_pair();
        let budget = RatchetPolicy::for_exchange(ExchangeType::EphemeralConnect)
            .dh_ratchet_every_n_messages;

        let mut ratchets = 0;
        for _ in 0..budget + 1 {
            let out = client.produce_outbound(b"tick").unwrap();
            if out.ratcheted {
                ratchets += 1;
            }
            server.process_inbound(&out.message).unwrap();
        }
        assert_eq!(ratchets, 1, "exactly one DH ratchet after the budget is hit");
    }

    #[test]
    fn state_roundtrip_is_identical() {
        let (_, mut client, _, mut server) = connected_pair();

        // Put some traffic and a skipped key into the state.
        let e0 = client.produce_outbound(b"a").unwrap().message;
        let e1 = client.produce_outbound(b"b").unwrap().message;
        server.process_inbound(&e1).unwrap();

        let record = server.to_state();
        let mut restored =
            RatchetConnection::from_state(42, ExchangeType::EphemeralConnect, &record);
        assert_eq!(restored.to_state(), record);

        // The restored ratchet still serves the skipped key.
        let inbound = restored.process_inbound(&e0).unwrap();
        assert!(inbound.used_skipped_key);
        assert_eq!(inbound.plaintext, b"a");
    }

    #[test]
    fn sync_with_remote_fast_forwards_chains() {
        let (_, mut client, _, mut server) = connected_pair();

        // Client sent 3 messages the (restored) server state never saw.
        let pending: Vec<_> = (0..3).map(|_| client.produce_outbound(b"p").unwrap().message).collect();

        let (send_len, recv_len) = server.sync_with_remote(3, 0).unwrap();
        assert_eq!(send_len, 0);
        assert_eq!(recv_len, 3);

        // The fast-forward cached the in-flight keys.
        for msg in &pending {
            assert!(server.process_inbound(msg).unwrap().used_skipped_key);
        }
    }

    #[test]
    fn sync_divergence_beyond_window_fails() {
        let (_, _, _, mut server) = connected_pair();
        let window = RatchetPolicy::for_exchange(ExchangeType::EphemeralConnect)
            .max_messages_without_ratchet;
        let err = server.sync_with_remote(window + 1, 0).unwrap_err();
        assert!(matches!(err, CryptoError::SessionValidation(_)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (_, mut client, _, mut server) = connected_pair();
        let mut msg = client.produce_outbound(b"intact").unwrap().message;
        if msg.ciphertext.is_empty() {
            msg.tag[0] ^= 0xFF;
        } else {
            msg.ciphertext[0] ^= 0xFF;
        }
        assert!(matches!(server.process_inbound(&msg), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn unestablished_connection_refuses_traffic() {
        let mut fresh = RatchetConnection::new(7, ExchangeType::ServerStreaming);
        assert!(matches!(
            fresh.produce_outbound(b"nope"),
            Err(CryptoError::ExchangeState(_))
        ));
    }

    #[test]
    fn authenticated_exchange_uses_supplied_root() {
        let client_keys = IdentityKeystore::create(0).unwrap();
        let server_keys = IdentityKeystore::create(0).unwrap();
        let mut client = RatchetConnection::new(42, ExchangeType::EphemeralConnect);
        let mut server = RatchetConnection::new(42, ExchangeType::EphemeralConnect);

        // Both sides hold the same master-derived root; no DH agreement runs.
        let root = kdf::root_key_from_master(&[0xAB; 32]).unwrap();
        let server_handshake = handshake_for(&server_keys, &server);
        let client_handshake = handshake_for(&client_keys, &client);

        client
            .complete_authenticated_exchange(&server_handshake, root)
            .unwrap();
        server
            .accept_authenticated_exchange(&client_handshake, root)
            .unwrap();

        let out = client.produce_outbound(b"authed").unwrap();
        assert_eq!(server.process_inbound(&out.message).unwrap().plaintext, b"authed");

        // A reply flows back over the same channel.
        let reply = server.produce_outbound(b"ack").unwrap();
        assert_eq!(client.process_inbound(&reply.message).unwrap().plaintext, b"ack");
    }
}
