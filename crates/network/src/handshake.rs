//! Discovery tags carried in handshake extension bytes.
//!
//! Layout: one tag byte, then for [`DiscoveryTag::IsPayoutNode`]
//! `varlen(peer id bytes)` and `varlen(settlement address)`, where
//! `varlen = [len: u16 BE][bytes]`. Empty extension bytes carry no tag.

use libp2p::PeerId;

use crate::NetworkError;

const TAG_IS_PAYOUT_NODE: u8 = 0x01;
const TAG_LOOKING_FOR_PAYOUT_NODE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryTag {
    IsPayoutNode {
        node: PeerId,
        settlement_address: String,
    },
    LookingForPayoutNode,
}

impl DiscoveryTag {
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        match self {
            Self::IsPayoutNode {
                node,
                settlement_address,
            } => {
                let id = node.to_bytes();
                let mut buf = Vec::with_capacity(5 + id.len() + settlement_address.len());
                buf.push(TAG_IS_PAYOUT_NODE);
                put_varlen(&mut buf, &id, "peer id")?;
                put_varlen(&mut buf, settlement_address.as_bytes(), "settlement address")?;
                Ok(buf)
            }
            Self::LookingForPayoutNode => Ok(vec![TAG_LOOKING_FOR_PAYOUT_NODE]),
        }
    }

    /// `Ok(None)` for empty extension bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Option<Self>, NetworkError> {
        let Some((&tag, mut rest)) = data.split_first() else {
            return Ok(None);
        };
        let tag = match tag {
            TAG_IS_PAYOUT_NODE => {
                let id = take_varlen(&mut rest)?;
                let address = take_varlen(&mut rest)?;
                let node = PeerId::from_bytes(id)
                    .map_err(|e| NetworkError::MalformedHandshake(format!("peer id: {}", e)))?;
                let settlement_address = std::str::from_utf8(address)
                    .map_err(|_| NetworkError::MalformedHandshake("address is not UTF-8".into()))?
                    .to_string();
                Self::IsPayoutNode {
                    node,
                    settlement_address,
                }
            }
            TAG_LOOKING_FOR_PAYOUT_NODE => Self::LookingForPayoutNode,
            other => {
                return Err(NetworkError::MalformedHandshake(format!(
                    "unknown tag 0x{:02x}",
                    other
                )))
            }
        };
        if !rest.is_empty() {
            return Err(NetworkError::MalformedHandshake(format!(
                "{} trailing bytes",
                rest.len()
            )));
        }
        Ok(Some(tag))
    }
}

fn put_varlen(buf: &mut Vec<u8>, bytes: &[u8], field: &'static str) -> Result<(), NetworkError> {
    let len = u16::try_from(bytes.len()).map_err(|_| NetworkError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn take_varlen<'a>(rest: &mut &'a [u8]) -> Result<&'a [u8], NetworkError> {
    if rest.len() < 2 {
        return Err(NetworkError::MalformedHandshake("truncated length".into()));
    }
    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    if rest.len() < 2 + len {
        return Err(NetworkError::MalformedHandshake("truncated field".into()));
    }
    let (field, tail) = rest[2..].split_at(len);
    *rest = tail;
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random_peer_id;

    #[test]
    fn test_is_payout_node_round_trip() {
        let tag = DiscoveryTag::IsPayoutNode {
            node: random_peer_id(),
            settlement_address: "bc1qpayout".into(),
        };
        let bytes = tag.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(DiscoveryTag::from_bytes(&bytes).unwrap(), Some(tag));
    }

    #[test]
    fn test_looking_and_empty() {
        assert_eq!(DiscoveryTag::LookingForPayoutNode.to_bytes().unwrap(), vec![0x02]);
        assert_eq!(
            DiscoveryTag::from_bytes(&[0x02]).unwrap(),
            Some(DiscoveryTag::LookingForPayoutNode)
        );
        assert_eq!(DiscoveryTag::from_bytes(&[]).unwrap(), None);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(DiscoveryTag::from_bytes(&[0x07]).is_err());
        assert!(DiscoveryTag::from_bytes(&[0x02, 0x00]).is_err());
        assert!(DiscoveryTag::from_bytes(&[0x01, 0x00]).is_err());
        assert!(DiscoveryTag::from_bytes(&[0x01, 0x00, 0x02, 0xAA, 0xBB, 0x00, 0x00]).is_err());

        let bytes = DiscoveryTag::IsPayoutNode {
            node: random_peer_id(),
            settlement_address: "addr".into(),
        }
        .to_bytes()
        .unwrap();
        assert!(DiscoveryTag::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_oversized_address_rejected() {
        let tag = DiscoveryTag::IsPayoutNode {
            node: random_peer_id(),
            settlement_address: "a".repeat(70_000),
        };
        assert!(matches!(
            tag.to_bytes(),
            Err(NetworkError::FieldTooLong {
                field: "settlement address",
                len: 70_000
            })
        ));
    }
}
