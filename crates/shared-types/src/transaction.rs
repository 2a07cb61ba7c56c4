//! Signed transactions.
//!
//! A transaction is identified by `keccak256(rlp)` and its sender is
//! recovered from the embedded recoverable signature, so no public key or
//! from-address travels on the wire. `to = None` denotes contract creation.

use crate::{primitives::*, EntityError};
use alloy_rlp::{BufMut, Decodable, Encodable, Header};
use shared_crypto::ecdsa::{self, KeyPair};
use shared_crypto::hashing::keccak256;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Transaction {
    nonce: u64,
    value: U256,
    gas_price: U256,
    gas: u64,
    to: Option<Address>,
    input: Bytes,
    chain_id: u64,
    signature: Signature65,

    cached_hash: OnceLock<TrxHash>,
    cached_sender: OnceLock<Address>,
}

impl Transaction {
    /// Create and sign a transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nonce: u64,
        value: U256,
        gas_price: U256,
        gas: u64,
        to: Option<Address>,
        input: Bytes,
        chain_id: u64,
        keypair: &KeyPair,
    ) -> Result<Self, EntityError> {
        let mut trx = Self {
            nonce,
            value,
            gas_price,
            gas,
            to,
            input,
            chain_id,
            signature: Signature65::ZERO,
            cached_hash: OnceLock::new(),
            cached_sender: OnceLock::new(),
        };
        let sig = keypair.sign_hash(&trx.unsigned_hash())?;
        trx.signature = signature_bytes(&sig);
        let _ = trx.cached_sender.set(keypair.address());
        Ok(trx)
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn value(&self) -> U256 {
        self.value
    }

    pub fn gas_price(&self) -> U256 {
        self.gas_price
    }

    pub fn gas(&self) -> u64 {
        self.gas
    }

    pub fn to(&self) -> Option<Address> {
        self.to
    }

    pub fn input(&self) -> &Bytes {
        &self.input
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn signature(&self) -> &Signature65 {
        &self.signature
    }

    /// `keccak256(rlp)`, cached after first computation.
    pub fn hash(&self) -> TrxHash {
        *self.cached_hash.get_or_init(|| keccak256(alloy_rlp::encode(self)))
    }

    /// Recover (and cache) the sender address.
    pub fn sender(&self) -> Result<Address, EntityError> {
        if let Some(sender) = self.cached_sender.get() {
            return Ok(*sender);
        }
        let sender = ecdsa::recover_signer(&self.unsigned_hash(), &recoverable(&self.signature))?;
        let _ = self.cached_sender.set(sender);
        Ok(sender)
    }

    /// Upper bound on the balance this transaction can consume.
    pub fn cost(&self) -> U256 {
        self.value
            .saturating_add(self.gas_price.saturating_mul(U256::from(self.gas)))
    }

    fn unsigned_hash(&self) -> B256 {
        let mut out = Vec::new();
        let payload_length = self.fields_length(false);
        Header { list: true, payload_length }.encode(&mut out);
        self.encode_fields(&mut out, false);
        keccak256(out)
    }

    fn fields_length(&self, with_signature: bool) -> usize {
        let mut len = self.nonce.length()
            + self.value.length()
            + self.gas_price.length()
            + self.gas.length()
            + to_field_length(&self.to)
            + self.input.length()
            + self.chain_id.length();
        if with_signature {
            len += self.signature.length();
        }
        len
    }

    fn encode_fields(&self, out: &mut dyn BufMut, with_signature: bool) {
        self.nonce.encode(out);
        self.value.encode(out);
        self.gas_price.encode(out);
        self.gas.encode(out);
        encode_to_field(&self.to, out);
        self.input.encode(out);
        self.chain_id.encode(out);
        if with_signature {
            self.signature.encode(out);
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Transaction {}

impl Encodable for Transaction {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.fields_length(true);
        Header { list: true, payload_length }.encode(out);
        self.encode_fields(out, true);
    }

    fn length(&self) -> usize {
        let payload_length = self.fields_length(true);
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Transaction {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Self {
            nonce: u64::decode(buf)?,
            value: U256::decode(buf)?,
            gas_price: U256::decode(buf)?,
            gas: u64::decode(buf)?,
            to: decode_to_field(buf)?,
            input: Bytes::decode(buf)?,
            chain_id: u64::decode(buf)?,
            signature: Signature65::decode(buf)?,
            cached_hash: OnceLock::new(),
            cached_sender: OnceLock::new(),
        })
    }
}

fn encode_to_field(to: &Option<Address>, out: &mut dyn BufMut) {
    match to {
        Some(addr) => addr.encode(out),
        // Contract creation: empty byte string.
        None => out.put_u8(alloy_rlp::EMPTY_STRING_CODE),
    }
}

fn to_field_length(to: &Option<Address>) -> usize {
    match to {
        Some(addr) => addr.length(),
        None => 1,
    }
}

fn decode_to_field(buf: &mut &[u8]) -> alloy_rlp::Result<Option<Address>> {
    if buf.first() == Some(&alloy_rlp::EMPTY_STRING_CODE) {
        *buf = &buf[1..];
        return Ok(None);
    }
    Ok(Some(Address::decode(buf)?))
}
