//! Wire payload for transaction notifications.
//!
//! The transport treats payloads as opaque; this is the one body the
//! relay engine itself builds and reads. Encoded with postcard, and the
//! collection bounds are enforced inside deserialization so a hostile
//! length prefix cannot force a large allocation.

use crate::net::levin::MessageWriter;
use crate::types::TxBlob;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Command id for tx notifications
pub const NOTIFY_NEW_TRANSACTIONS: u32 = 2002;

/// Upper bound on blobs per notification
pub const MAX_TXS_PER_MESSAGE: usize = 50_000;

/// Upper bound on one tx blob; anything larger is rejected long before
/// consensus rules would see it
pub const MAX_TX_BLOB_BYTES: usize = 1024 * 1024;

/// Fluffed messages are padded up to the next multiple of this
const PADDING_GRANULARITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransactions {
    pub txs: TxList,
    /// Dummy bytes countering traffic-volume analysis; receivers ignore it
    pub padding: Padding,
    /// True once the batch left the stem phase
    pub dandelionpp_fluff: bool,
}

/// Transaction blobs as they ride the wire. Decoding rejects batches
/// over [`MAX_TXS_PER_MESSAGE`], blobs over [`MAX_TX_BLOB_BYTES`], and
/// empty blobs (an empty blob carries nothing and only inflates the
/// fluff queues of every peer it reaches).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxList(Vec<TxBlob>);

impl TxList {
    pub fn new(txs: Vec<TxBlob>) -> Option<Self> {
        let fits = txs.len() <= MAX_TXS_PER_MESSAGE
            && txs.iter().all(|tx| !tx.is_empty() && tx.len() <= MAX_TX_BLOB_BYTES);
        fits.then_some(Self(txs))
    }

    /// Send side only; the relay never builds an out-of-bounds batch
    fn from_local(txs: Vec<TxBlob>) -> Self {
        debug_assert!(txs.len() <= MAX_TXS_PER_MESSAGE);
        Self(txs)
    }

    pub fn into_inner(self) -> Vec<TxBlob> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TxBlob> {
        self.0.iter()
    }
}

impl Serialize for TxList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TxList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TxListVisitor;

        impl<'de> de::Visitor<'de> for TxListVisitor {
            type Value = TxList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    formatter,
                    "at most {} non-empty tx blobs of at most {} bytes",
                    MAX_TXS_PER_MESSAGE, MAX_TX_BLOB_BYTES
                )
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let size_hint = seq.size_hint().unwrap_or(0);
                if size_hint > MAX_TXS_PER_MESSAGE {
                    return Err(de::Error::invalid_length(size_hint, &self));
                }

                let mut txs = Vec::with_capacity(size_hint.min(MAX_TXS_PER_MESSAGE));
                while let Some(blob) = seq.next_element::<TxBlob>()? {
                    if txs.len() >= MAX_TXS_PER_MESSAGE {
                        return Err(de::Error::invalid_length(txs.len() + 1, &self));
                    }
                    if blob.is_empty() {
                        return Err(de::Error::custom("empty tx blob"));
                    }
                    if blob.len() > MAX_TX_BLOB_BYTES {
                        return Err(de::Error::custom("tx blob over size limit"));
                    }
                    txs.push(blob);
                }
                Ok(TxList(txs))
            }
        }

        deserializer.deserialize_seq(TxListVisitor)
    }
}

/// Traffic-shaping filler. Never legitimately longer than one
/// granularity step, so decoding caps it there.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Padding(Vec<u8>);

impl Padding {
    fn spaces(len: usize) -> Self {
        debug_assert!(len < PADDING_GRANULARITY);
        Self(vec![b' '; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Padding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Padding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PaddingVisitor;

        impl<'de> de::Visitor<'de> for PaddingVisitor {
            type Value = Padding;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "at most {} padding bytes", PADDING_GRANULARITY - 1)
            }

            fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<Self::Value, E> {
                if bytes.len() >= PADDING_GRANULARITY {
                    return Err(de::Error::invalid_length(bytes.len(), &self));
                }
                Ok(Padding(bytes.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> Result<Self::Value, E> {
                if bytes.len() >= PADDING_GRANULARITY {
                    return Err(de::Error::invalid_length(bytes.len(), &self));
                }
                Ok(Padding(bytes))
            }
        }

        deserializer.deserialize_byte_buf(PaddingVisitor)
    }
}

fn encode(request: &NewTransactions) -> Vec<u8> {
    postcard::to_allocvec(request).expect("tx payload serialization cannot fail")
}

/// Build the notification body. With `pad`, the encoded message is grown
/// to the next 1 KiB boundary; the second pass trims the estimate's
/// overshoot. When trimming shrinks the length varint the result can
/// land short of the boundary, which is acceptable.
pub fn make_tx_payload(txs: Vec<TxBlob>, pad: bool, fluff: bool) -> MessageWriter {
    let mut request = NewTransactions {
        txs: TxList::from_local(txs),
        padding: Padding::default(),
        dandelionpp_fluff: fluff,
    };

    if pad {
        let base = encode(&request).len();
        let mut padding = PADDING_GRANULARITY - base % PADDING_GRANULARITY;
        if padding == PADDING_GRANULARITY {
            padding = 0;
        }
        request.padding = Padding::spaces(padding);

        let overshoot = encode(&request).len() % PADDING_GRANULARITY;
        let keep = request.padding.len().saturating_sub(overshoot);
        request.padding = Padding::spaces(keep);
    }

    let bytes = encode(&request);
    let mut writer = MessageWriter::with_capacity(bytes.len());
    writer.write(&bytes);
    writer
}

/// Decode a notification body, tolerating the zero padding a fragmented
/// transfer appends past the encoded value.
pub fn parse_tx_payload(bytes: &[u8]) -> Result<NewTransactions, postcard::Error> {
    postcard::take_from_bytes::<NewTransactions>(bytes).map(|(value, _rest)| value)
}
