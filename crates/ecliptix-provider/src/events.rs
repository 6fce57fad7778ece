//! Session-to-provider feedback capability.

/// Callbacks a session raises as its ratchet evolves.
///
/// Implemented by the provider; sessions hold a non-owning reference so the
/// provider → session → provider cycle never keeps either alive.
pub trait ProtocolEvents: Send + Sync {
    /// A DH ratchet step completed on the sending or receiving chain.
    fn on_ratchet_performed(&self, connect_id: u32, is_sending: bool, new_index: u32);

    /// Chain counters were reconciled with the server after a restore.
    fn on_chain_synchronized(&self, connect_id: u32, local_len: u32, remote_len: u32);

    /// An inbound envelope was decrypted and delivered.
    fn on_message_processed(&self, connect_id: u32, receiving_index: u32);
}
