//! The slate: the envelope participants exchange while building a
//! transaction interactively.
//!
//! The slate accumulates inputs, outputs, and participant public data
//! (blind excess, nonce, partial signature) across rounds until the sender
//! finalizes a kernel. On the wire it is a versioned JSON schema: points and
//! scalars hex-encoded, range proofs base64-encoded. Versions above ours are
//! rejected rather than guessed at.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WalletError;
use crate::core::transaction::{
    kernel_sig_msg, KernelFeatures, Transaction,
};
use crate::core::hash::Hash;
use crate::crypto::keys::{sum_public_keys, PublicKey};
use crate::crypto::rangeproof::RangeProof;
use crate::crypto::schnorr::{PartialSignature, Signature};

/// Highest slate version this wallet speaks.
pub const SLATE_VERSION: u16 = 2;

/// Participants per slate; 0 is the sender, 1 the receiver.
pub const MAX_PARTICIPANTS: usize = 2;

/// One participant's public contribution.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticipantData {
    pub id: u64,
    pub public_blind_excess: PublicKey,
    pub public_nonce: PublicKey,
    pub part_sig: Option<PartialSignature>,
    pub message: Option<String>,
    pub message_sig: Option<Signature>,
}

/// The working slate.
#[derive(Clone, Debug)]
pub struct Slate {
    pub version: u16,
    pub id: Uuid,
    pub amount: u64,
    pub fee: u64,
    pub height: u64,
    pub lock_height: u64,
    /// Inputs, outputs, and the offset accumulated across rounds; the
    /// kernel lands here at finalization.
    pub tx: Transaction,
    pub participants: Vec<ParticipantData>,
}

impl Slate {
    pub fn new(amount: u64, fee: u64, height: u64, lock_height: u64, tx: Transaction) -> Self {
        Slate {
            version: SLATE_VERSION,
            id: Uuid::new_v4(),
            amount,
            fee,
            height,
            lock_height,
            tx,
            participants: vec![],
        }
    }

    /// The kernel features this slate finalizes into.
    pub fn kernel_features(&self) -> KernelFeatures {
        if self.lock_height > 0 {
            KernelFeatures::HeightLocked
        } else {
            KernelFeatures::Plain
        }
    }

    /// The message every participant signs.
    pub fn kernel_msg(&self) -> Hash {
        kernel_sig_msg(self.kernel_features(), self.fee, self.lock_height)
    }

    pub fn add_participant(&mut self, data: ParticipantData) -> Result<(), WalletError> {
        if self.participants.len() >= MAX_PARTICIPANTS {
            return Err(WalletError::TooManyParticipants);
        }
        self.participants.push(data);
        Ok(())
    }

    pub fn participant(&self, id: u64) -> Result<&ParticipantData, WalletError> {
        self.participants
            .iter()
            .find(|p| p.id == id)
            .ok_or(WalletError::MissingParticipant(id))
    }

    /// `R_sum` over all participants.
    pub fn public_nonce_sum(&self) -> Result<PublicKey, WalletError> {
        let nonces: Vec<PublicKey> = self.participants.iter().map(|p| p.public_nonce).collect();
        Ok(sum_public_keys(&nonces)?)
    }

    /// `P_sum` over all participants; this is the kernel excess.
    pub fn public_blind_sum(&self) -> Result<PublicKey, WalletError> {
        let keys: Vec<PublicKey> = self
            .participants
            .iter()
            .map(|p| p.public_blind_excess)
            .collect();
        Ok(sum_public_keys(&keys)?)
    }

    /// Serialize to versioned JSON.
    pub fn to_json(&self) -> Result<String, WalletError> {
        let v2 = SlateV2::from(self);
        serde_json::to_string_pretty(&v2).map_err(|e| WalletError::Slate(e.to_string()))
    }

    /// Parse from versioned JSON, rejecting versions above ours.
    pub fn from_json(json: &str) -> Result<Self, WalletError> {
        let probe: VersionProbe = serde_json::from_str(json)
            .map_err(|e| WalletError::Slate(format!("unparsable: {e}")))?;
        if probe.version > SLATE_VERSION {
            return Err(WalletError::SlateVersionMismatch {
                max: SLATE_VERSION,
                got: probe.version,
            });
        }
        let v2: SlateV2 = serde_json::from_str(json)
            .map_err(|e| WalletError::Slate(format!("unparsable: {e}")))?;
        v2.try_into()
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u16,
}

// ── Versioned JSON schema ──
//
// The V2 DTOs pin the external representation independently of the core
// types: hex for commitments, points, scalars, and signatures; base64 for
// range proofs.

#[derive(Serialize, Deserialize)]
struct SlateV2 {
    version: u16,
    num_participants: usize,
    id: Uuid,
    amount: u64,
    fee: u64,
    height: u64,
    lock_height: u64,
    tx: TransactionV2,
    participant_data: Vec<ParticipantDataV2>,
}

#[derive(Serialize, Deserialize)]
struct TransactionV2 {
    offset: String,
    inputs: Vec<InputV2>,
    outputs: Vec<OutputV2>,
    kernels: Vec<TxKernelV2>,
}

#[derive(Serialize, Deserialize)]
struct InputV2 {
    features: u8,
    commit: String,
}

#[derive(Serialize, Deserialize)]
struct OutputV2 {
    features: u8,
    commit: String,
    proof: String,
}

#[derive(Serialize, Deserialize)]
struct TxKernelV2 {
    features: u8,
    fee: u64,
    lock_height: u64,
    excess: String,
    excess_sig: String,
}

#[derive(Serialize, Deserialize)]
struct ParticipantDataV2 {
    id: u64,
    public_blind_excess: String,
    public_nonce: String,
    part_sig: Option<String>,
    message: Option<String>,
    message_sig: Option<String>,
}

impl From<&Slate> for SlateV2 {
    fn from(slate: &Slate) -> Self {
        use crate::core::transaction::OutputFeatures;
        let features_u8 = |f: OutputFeatures| match f {
            OutputFeatures::Plain => 0u8,
            OutputFeatures::Coinbase => 1u8,
        };
        let kernel_features_u8 = |f: KernelFeatures| match f {
            KernelFeatures::Plain => 0u8,
            KernelFeatures::Coinbase => 1u8,
            KernelFeatures::HeightLocked => 2u8,
            KernelFeatures::NoRecentDuplicate => 3u8,
        };
        SlateV2 {
            version: slate.version,
            num_participants: MAX_PARTICIPANTS,
            id: slate.id,
            amount: slate.amount,
            fee: slate.fee,
            height: slate.height,
            lock_height: slate.lock_height,
            tx: TransactionV2 {
                offset: hex::encode(slate.tx.offset.to_bytes()),
                inputs: slate
                    .tx
                    .body
                    .inputs
                    .iter()
                    .map(|i| InputV2 {
                        features: features_u8(i.features),
                        commit: i.commitment.to_hex(),
                    })
                    .collect(),
                outputs: slate
                    .tx
                    .body
                    .outputs
                    .iter()
                    .map(|o| OutputV2 {
                        features: features_u8(o.features),
                        commit: o.commitment.to_hex(),
                        proof: BASE64.encode(o.proof.as_bytes()),
                    })
                    .collect(),
                kernels: slate
                    .tx
                    .body
                    .kernels
                    .iter()
                    .map(|k| TxKernelV2 {
                        features: kernel_features_u8(k.features),
                        fee: k.fee,
                        lock_height: k.lock_height,
                        excess: k.excess.to_hex(),
                        excess_sig: k.excess_sig.to_hex(),
                    })
                    .collect(),
            },
            participant_data: slate
                .participants
                .iter()
                .map(|p| ParticipantDataV2 {
                    id: p.id,
                    public_blind_excess: p.public_blind_excess.to_hex(),
                    public_nonce: p.public_nonce.to_hex(),
                    part_sig: p.part_sig.as_ref().map(|s| s.to_hex()),
                    message: p.message.clone(),
                    message_sig: p.message_sig.as_ref().map(|s| s.to_hex()),
                })
                .collect(),
        }
    }
}

fn bad_slate(what: &str) -> WalletError {
    WalletError::Slate(format!("bad field: {what}"))
}

impl TryFrom<SlateV2> for Slate {
    type Error = WalletError;

    fn try_from(v2: SlateV2) -> Result<Self, WalletError> {
        use crate::core::transaction::{
            Input, Output, OutputFeatures, TransactionBody, TxKernel,
        };
        use crate::crypto::commitment::{BlindingFactor, Commitment};

        if v2.participant_data.len() > MAX_PARTICIPANTS {
            return Err(WalletError::TooManyParticipants);
        }

        let output_features = |f: u8| match f {
            0 => Ok(OutputFeatures::Plain),
            1 => Ok(OutputFeatures::Coinbase),
            _ => Err(bad_slate("output features")),
        };
        let kernel_features = |f: u8| match f {
            0 => Ok(KernelFeatures::Plain),
            1 => Ok(KernelFeatures::Coinbase),
            2 => Ok(KernelFeatures::HeightLocked),
            3 => Ok(KernelFeatures::NoRecentDuplicate),
            _ => Err(bad_slate("kernel features")),
        };

        let mut inputs = vec![];
        for input in &v2.tx.inputs {
            inputs.push(Input {
                features: output_features(input.features)?,
                commitment: Commitment::from_hex(&input.commit)
                    .ok_or_else(|| bad_slate("input commit"))?,
            });
        }
        let mut outputs = vec![];
        for output in &v2.tx.outputs {
            let proof_bytes = BASE64
                .decode(&output.proof)
                .map_err(|_| bad_slate("proof base64"))?;
            outputs.push(Output {
                features: output_features(output.features)?,
                commitment: Commitment::from_hex(&output.commit)
                    .ok_or_else(|| bad_slate("output commit"))?,
                proof: RangeProof::from_bytes(proof_bytes)
                    .map_err(|_| bad_slate("proof length"))?,
            });
        }
        let mut kernels = vec![];
        for kernel in &v2.tx.kernels {
            kernels.push(TxKernel {
                features: kernel_features(kernel.features)?,
                fee: kernel.fee,
                lock_height: kernel.lock_height,
                excess: Commitment::from_hex(&kernel.excess)
                    .ok_or_else(|| bad_slate("kernel excess"))?,
                excess_sig: Signature::from_hex(&kernel.excess_sig)
                    .ok_or_else(|| bad_slate("kernel signature"))?,
            });
        }

        let offset_bytes: [u8; 32] = hex::decode(&v2.tx.offset)
            .map_err(|_| bad_slate("offset"))?
            .try_into()
            .map_err(|_| bad_slate("offset length"))?;
        let body = TransactionBody::new(inputs, outputs, kernels)?;
        let tx = Transaction::new(BlindingFactor::from_bytes(offset_bytes), body);

        let mut participants = vec![];
        for p in &v2.participant_data {
            participants.push(ParticipantData {
                id: p.id,
                public_blind_excess: PublicKey::from_hex(&p.public_blind_excess)
                    .ok_or_else(|| bad_slate("blind excess"))?,
                public_nonce: PublicKey::from_hex(&p.public_nonce)
                    .ok_or_else(|| bad_slate("nonce"))?,
                part_sig: match &p.part_sig {
                    Some(s) => {
                        Some(PartialSignature::from_hex(s).ok_or_else(|| bad_slate("part sig"))?)
                    }
                    None => None,
                },
                message: p.message.clone(),
                message_sig: match &p.message_sig {
                    Some(s) => {
                        Some(Signature::from_hex(s).ok_or_else(|| bad_slate("message sig"))?)
                    }
                    None => None,
                },
            });
        }

        Ok(Slate {
            version: v2.version,
            id: v2.id,
            amount: v2.amount,
            fee: v2.fee,
            height: v2.height,
            lock_height: v2.lock_height,
            tx,
            participants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TransactionBody;
    use crate::crypto::commitment::BlindingFactor;
    use crate::crypto::keys::{PublicKey, SecretKey};

    fn empty_slate() -> Slate {
        let tx = Transaction::new(BlindingFactor::random(), TransactionBody::empty());
        Slate::new(1_000_000, 8_000, 10, 0, tx)
    }

    #[test]
    fn json_roundtrip_empty() {
        let slate = empty_slate();
        let json = slate.to_json().unwrap();
        let back = Slate::from_json(&json).unwrap();
        assert_eq!(back.id, slate.id);
        assert_eq!(back.amount, slate.amount);
        assert_eq!(back.fee, slate.fee);
        assert_eq!(back.tx.offset, slate.tx.offset);
    }

    #[test]
    fn json_roundtrip_with_participant() {
        let mut slate = empty_slate();
        let sk = SecretKey::from_bytes([3u8; 32]);
        slate
            .add_participant(ParticipantData {
                id: 0,
                public_blind_excess: PublicKey::from_secret(&sk),
                public_nonce: PublicKey::from_secret(&SecretKey::from_bytes([4u8; 32])),
                part_sig: None,
                message: Some("hello".into()),
                message_sig: None,
            })
            .unwrap();
        let json = slate.to_json().unwrap();
        let back = Slate::from_json(&json).unwrap();
        assert_eq!(back.participants.len(), 1);
        assert_eq!(back.participants[0], slate.participants[0]);
    }

    #[test]
    fn future_version_rejected() {
        let slate = empty_slate();
        let mut value: serde_json::Value =
            serde_json::from_str(&slate.to_json().unwrap()).unwrap();
        value["version"] = serde_json::json!(9);
        let json = value.to_string();
        assert!(matches!(
            Slate::from_json(&json),
            Err(WalletError::SlateVersionMismatch { got: 9, .. })
        ));
    }

    #[test]
    fn participant_cap_enforced() {
        let mut slate = empty_slate();
        for id in 0..MAX_PARTICIPANTS as u64 {
            slate
                .add_participant(ParticipantData {
                    id,
                    public_blind_excess: PublicKey::from_secret(&SecretKey::from_bytes(
                        [id as u8 + 1; 32],
                    )),
                    public_nonce: PublicKey::from_secret(&SecretKey::from_bytes(
                        [id as u8 + 10; 32],
                    )),
                    part_sig: None,
                    message: None,
                    message_sig: None,
                })
                .unwrap();
        }
        let extra = ParticipantData {
            id: 99,
            public_blind_excess: PublicKey::from_secret(&SecretKey::from_bytes([99u8; 32])),
            public_nonce: PublicKey::from_secret(&SecretKey::from_bytes([98u8; 32])),
            part_sig: None,
            message: None,
            message_sig: None,
        };
        assert!(matches!(
            slate.add_participant(extra),
            Err(WalletError::TooManyParticipants)
        ));
    }

    #[test]
    fn garbage_json_rejected() {
        assert!(Slate::from_json("not json").is_err());
        assert!(Slate::from_json("{}").is_err());
    }
}
