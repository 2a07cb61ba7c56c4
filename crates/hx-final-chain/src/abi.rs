//! Solidity ABI encoding for the DPoS system contract.
//!
//! Calls are `keccak256(signature)[0..4]` followed by the 32-byte-padded
//! argument area; dynamic arguments (bytes, string) are referenced by
//! offset from the start of the argument area with their payload appended
//! after the static head.

use shared_crypto::hashing::keccak256;
use shared_types::{Address, Bytes, B256, U256};

/// Fixed address of the DPoS system contract.
pub const DPOS_CONTRACT_ADDRESS: Address = Address::new([
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xFE,
]);

/// An ABI-encodable argument.
#[derive(Debug, Clone)]
pub enum Token {
    Address(Address),
    Uint(U256),
    Bytes(Vec<u8>),
    String(String),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        matches!(self, Token::Bytes(_) | Token::String(_))
    }

    fn head_word(&self) -> Option<B256> {
        match self {
            Token::Address(addr) => Some(B256::left_padding_from(addr.as_slice())),
            Token::Uint(value) => Some(B256::from(value.to_be_bytes::<32>())),
            _ => None,
        }
    }

    fn tail(&self) -> Vec<u8> {
        let payload = match self {
            Token::Bytes(data) => data.as_slice(),
            Token::String(data) => data.as_bytes(),
            _ => return vec![],
        };
        let mut out = Vec::with_capacity(32 + payload.len().div_ceil(32) * 32);
        out.extend_from_slice(&U256::from(payload.len()).to_be_bytes::<32>());
        out.extend_from_slice(payload);
        // Pad the payload to a word boundary.
        let rem = payload.len() % 32;
        if rem != 0 {
            out.extend(std::iter::repeat(0u8).take(32 - rem));
        }
        out
    }
}

/// The 4-byte function selector for a signature like `"delegate(address)"`.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encode a full call: selector plus head/tail argument area.
pub fn encode_call(signature: &str, tokens: &[Token]) -> Bytes {
    let head_size = 32 * tokens.len();
    let mut head = Vec::with_capacity(head_size);
    let mut tail: Vec<u8> = Vec::new();

    for token in tokens {
        if token.is_dynamic() {
            let offset = head_size + tail.len();
            head.extend_from_slice(&U256::from(offset).to_be_bytes::<32>());
            tail.extend_from_slice(&token.tail());
        } else {
            head.extend_from_slice(token.head_word().expect("static token").as_slice());
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    Bytes::from(out)
}

pub fn commit_double_voting_proof(vote_a_rlp: &[u8], vote_b_rlp: &[u8]) -> Bytes {
    encode_call(
        "commitDoubleVotingProof(bytes,bytes)",
        &[
            Token::Bytes(vote_a_rlp.to_vec()),
            Token::Bytes(vote_b_rlp.to_vec()),
        ],
    )
}

pub fn delegate(validator: Address) -> Bytes {
    encode_call("delegate(address)", &[Token::Address(validator)])
}

pub fn undelegate(validator: Address, amount: U256) -> Bytes {
    encode_call(
        "undelegate(address,uint256)",
        &[Token::Address(validator), Token::Uint(amount)],
    )
}

pub fn redelegate(from: Address, to: Address, amount: U256) -> Bytes {
    encode_call(
        "reDelegate(address,address,uint256)",
        &[Token::Address(from), Token::Address(to), Token::Uint(amount)],
    )
}

pub fn register_validator(
    validator: Address,
    proof: &[u8],
    vrf_key: &[u8],
    commission: u16,
    endpoint: &str,
    description: &str,
) -> Bytes {
    encode_call(
        "registerValidator(address,bytes,bytes,uint16,string,string)",
        &[
            Token::Address(validator),
            Token::Bytes(proof.to_vec()),
            Token::Bytes(vrf_key.to_vec()),
            Token::Uint(U256::from(commission)),
            Token::String(endpoint.into()),
            Token::String(description.into()),
        ],
    )
}

/// Decoded system contract calls the in-memory state dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DposCall {
    CommitDoubleVotingProof { vote_a: Vec<u8>, vote_b: Vec<u8> },
    Delegate { validator: Address },
    Undelegate { validator: Address, amount: U256 },
}

/// Parse a call payload addressed to the system contract. Unknown
/// selectors yield `None` and execute as plain value transfers.
pub fn parse_call(input: &[u8]) -> Option<DposCall> {
    if input.len() < 4 {
        return None;
    }
    let (sel, args) = input.split_at(4);

    if sel == selector("commitDoubleVotingProof(bytes,bytes)") {
        let vote_a = read_dynamic_bytes(args, 0)?;
        let vote_b = read_dynamic_bytes(args, 1)?;
        return Some(DposCall::CommitDoubleVotingProof { vote_a, vote_b });
    }
    if sel == selector("delegate(address)") {
        return Some(DposCall::Delegate {
            validator: read_address(args, 0)?,
        });
    }
    if sel == selector("undelegate(address,uint256)") {
        return Some(DposCall::Undelegate {
            validator: read_address(args, 0)?,
            amount: read_uint(args, 1)?,
        });
    }
    None
}

fn read_word(args: &[u8], index: usize) -> Option<&[u8]> {
    args.get(index * 32..(index + 1) * 32)
}

fn read_address(args: &[u8], index: usize) -> Option<Address> {
    read_word(args, index).map(|word| Address::from_slice(&word[12..]))
}

fn read_uint(args: &[u8], index: usize) -> Option<U256> {
    read_word(args, index).map(|word| U256::from_be_slice(word))
}

fn read_dynamic_bytes(args: &[u8], index: usize) -> Option<Vec<u8>> {
    let offset = usize::try_from(read_uint(args, index)?).ok()?;
    let len = usize::try_from(U256::from_be_slice(args.get(offset..offset + 32)?)).ok()?;
    args.get(offset + 32..offset + 32 + len).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_known_value() {
        // keccak("delegate(address)") starts with 0x5c19a95c.
        assert_eq!(selector("delegate(address)"), [0x5c, 0x19, 0xa9, 0x5c]);
    }

    #[test]
    fn test_delegate_roundtrip() {
        let validator = Address::repeat_byte(0xAB);
        let call = delegate(validator);
        assert_eq!(call.len(), 4 + 32);
        assert_eq!(parse_call(&call), Some(DposCall::Delegate { validator }));
    }

    #[test]
    fn test_undelegate_roundtrip() {
        let validator = Address::repeat_byte(0xCD);
        let amount = U256::from(123_456u64);
        let call = undelegate(validator, amount);
        assert_eq!(
            parse_call(&call),
            Some(DposCall::Undelegate { validator, amount })
        );
    }

    #[test]
    fn test_double_voting_proof_roundtrip() {
        let vote_a = vec![0x01; 70];
        let vote_b = vec![0x02; 33];
        let call = commit_double_voting_proof(&vote_a, &vote_b);

        match parse_call(&call) {
            Some(DposCall::CommitDoubleVotingProof { vote_a: a, vote_b: b }) => {
                assert_eq!(a, vote_a);
                assert_eq!(b, vote_b);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_dynamic_payloads_word_aligned() {
        let call = commit_double_voting_proof(&[0xAA; 5], &[0xBB; 32]);
        // selector + 2 head words + (len + padded 5) + (len + 32)
        assert_eq!(call.len(), 4 + 64 + (32 + 32) + (32 + 32));
    }

    #[test]
    fn test_unknown_selector_ignored() {
        assert_eq!(parse_call(&[0xde, 0xad, 0xbe, 0xef, 0x00]), None);
        assert_eq!(parse_call(&[]), None);
    }

    #[test]
    fn test_register_validator_shape() {
        let call = register_validator(
            Address::repeat_byte(0x01),
            &[0u8; 65],
            &[1u8; 32],
            500,
            "tcp://validator:10002",
            "helix validator",
        );
        // Selector + 6 head words at minimum, dynamic tails appended.
        assert!(call.len() > 4 + 6 * 32);
        assert_eq!(&call[..4], &selector("registerValidator(address,bytes,bytes,uint16,string,string)"));
    }
}
