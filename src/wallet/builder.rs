//! Three-pass interactive transaction construction.
//!
//! 1. **Sender round 1** — select inputs, compute fee and change, contribute
//!    the sender's public blind excess and nonce.
//! 2. **Receiver** — append the receiving output and a partial signature
//!    over the shared nonce and key sums.
//! 3. **Sender round 2** — verify the receiver's partial, add the sender's,
//!    aggregate into the kernel signature, and assemble the final
//!    transaction.
//!
//! Every partial signature is verified before aggregation, and the
//! finalized transaction revalidates completely before leaving the wallet.

use super::slate::{ParticipantData, Slate};
use super::{OwnedOutput, WalletError};
use crate::consensus;
use crate::core::transaction::{
    Input, Output, OutputFeatures, Transaction, TransactionBody, TxKernel,
};
use crate::crypto::commitment::{add_blinding_factors, commit, BlindingFactor, Commitment};
use crate::crypto::keys::{Keychain, PublicKey, SecretKey};
use crate::crypto::rangeproof::{self, PROOF_MESSAGE_LEN};
use crate::crypto::schnorr;

/// Input selection strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Spend the smallest outputs first, minimizing UTXO dust.
    SmallestFirst,
    /// Spend everything, consolidating the wallet.
    All,
}

/// The sender's secret state between round 1 and finalization.
pub struct SenderContext {
    pub sec_key: SecretKey,
    pub sec_nonce: SecretKey,
    /// Key indices of the inputs locked by this slate.
    pub locked_inputs: Vec<u32>,
    /// Key index of the change output, if any.
    pub change_index: Option<u32>,
}

/// Fee for a transaction shape under the relay policy.
pub fn estimate_fee(n_inputs: u64, n_outputs: u64) -> u64 {
    consensus::min_relay_fee(consensus::body_weight(n_inputs, n_outputs, 1))
}

/// Pick inputs covering `amount` plus the fee implied by the pick.
///
/// Returns the chosen outputs and the fee. The fee grows with each added
/// input, so selection iterates until the pick covers itself.
pub fn select_coins(
    spendable: &[OwnedOutput],
    amount: u64,
    strategy: SelectionStrategy,
    explicit_fee: Option<u64>,
) -> Result<(Vec<OwnedOutput>, u64), WalletError> {
    let mut candidates = spendable.to_vec();
    candidates.sort_by_key(|o| o.value);

    let available: u64 = candidates.iter().map(|o| o.value).sum();
    let fee_for = |n_inputs: u64| explicit_fee.unwrap_or_else(|| estimate_fee(n_inputs, 2));

    let picked: Vec<OwnedOutput> = match strategy {
        SelectionStrategy::All => candidates,
        SelectionStrategy::SmallestFirst => {
            let mut picked = vec![];
            let mut total = 0u64;
            for output in candidates {
                total += output.value;
                picked.push(output);
                if total >= amount.saturating_add(fee_for(picked.len() as u64)) {
                    break;
                }
            }
            picked
        }
    };

    let total: u64 = picked.iter().map(|o| o.value).sum();
    let fee = fee_for(picked.len() as u64);
    let needed = amount.saturating_add(fee);
    if total < needed {
        return Err(WalletError::InsufficientFunds {
            available,
            needed,
        });
    }
    Ok((picked, fee))
}

/// Sender round 1: build the initial slate and the sender's secret context.
pub fn sender_round_1(
    keychain: &Keychain,
    spendable: &[OwnedOutput],
    amount: u64,
    strategy: SelectionStrategy,
    explicit_fee: Option<u64>,
    height: u64,
    lock_height: u64,
    change_key_index: u32,
) -> Result<(Slate, SenderContext), WalletError> {
    let (picked, fee) = select_coins(spendable, amount, strategy, explicit_fee)?;
    let total: u64 = picked.iter().map(|o| o.value).sum();
    let change_value = total - amount - fee;

    let inputs: Vec<Input> = picked
        .iter()
        .map(|o| Input {
            features: OutputFeatures::Plain,
            commitment: o.commitment,
        })
        .collect();
    let input_blinds: Vec<BlindingFactor> = picked
        .iter()
        .map(|o| keychain.derive_blinding(o.key_index))
        .collect();

    let mut outputs = vec![];
    let mut change_blinds = vec![];
    let mut change_index = None;
    if change_value > 0 {
        let blind = keychain.derive_blinding(change_key_index);
        outputs.push(build_output_for(
            keychain,
            change_value,
            &blind,
            change_key_index,
        )?);
        change_blinds.push(blind);
        change_index = Some(change_key_index);
    }

    // Split a random offset out of the sender's excess so the kernel alone
    // links to nothing.
    let offset = BlindingFactor::random();
    let sender_excess = add_blinding_factors(
        &change_blinds,
        &input_blinds
            .iter()
            .cloned()
            .chain(std::iter::once(offset.clone()))
            .collect::<Vec<_>>(),
    );
    let sec_key = SecretKey::from(&sender_excess);
    let sec_nonce = SecretKey::random();

    let body = TransactionBody::new(inputs, outputs, vec![])?;
    let tx = Transaction::new(offset, body);
    let mut slate = Slate::new(amount, fee, height, lock_height, tx);
    slate.add_participant(ParticipantData {
        id: 0,
        public_blind_excess: PublicKey::from_secret(&sec_key),
        public_nonce: PublicKey::from_secret(&sec_nonce),
        part_sig: None,
        message: None,
        message_sig: None,
    })?;

    Ok((
        slate,
        SenderContext {
            sec_key,
            sec_nonce,
            locked_inputs: picked.iter().map(|o| o.key_index).collect(),
            change_index,
        },
    ))
}

/// Receiver round: append the receiving output and a partial signature.
///
/// Returns the receiver's new output so the wallet can track it.
pub fn receive(
    keychain: &Keychain,
    slate: &mut Slate,
    output_key_index: u32,
) -> Result<OwnedOutput, WalletError> {
    if slate.version > super::slate::SLATE_VERSION {
        return Err(WalletError::SlateVersionMismatch {
            max: super::slate::SLATE_VERSION,
            got: slate.version,
        });
    }
    // Round 1 must have produced exactly the sender entry.
    slate.participant(0)?;

    let blind = keychain.derive_blinding(output_key_index);
    let output = build_output_for(keychain, slate.amount, &blind, output_key_index)?;
    let owned = OwnedOutput {
        key_index: output_key_index,
        value: slate.amount,
        commitment: output.commitment,
    };

    let mut outputs = slate.tx.body.outputs.clone();
    outputs.push(output);
    let body = TransactionBody::new(
        slate.tx.body.inputs.clone(),
        outputs,
        slate.tx.body.kernels.clone(),
    )?;
    slate.tx = Transaction::new(slate.tx.offset.clone(), body);

    let sec_key = SecretKey::from(&blind);
    let sec_nonce = SecretKey::random();
    slate.add_participant(ParticipantData {
        id: 1,
        public_blind_excess: PublicKey::from_secret(&sec_key),
        public_nonce: PublicKey::from_secret(&sec_nonce),
        part_sig: None,
        message: None,
        message_sig: None,
    })?;

    let nonce_sum = slate.public_nonce_sum()?;
    let blind_sum = slate.public_blind_sum()?;
    let msg = slate.kernel_msg();
    let part_sig = schnorr::sign_partial(&sec_key, &sec_nonce, &nonce_sum, &blind_sum, &msg);
    slate
        .participants
        .iter_mut()
        .find(|p| p.id == 1)
        .expect("participant just added")
        .part_sig = Some(part_sig);

    Ok(owned)
}

/// Sender round 2: verify the receiver's partial, contribute the sender's,
/// aggregate the kernel signature, and build the final transaction.
pub fn finalize(slate: &mut Slate, ctx: &SenderContext) -> Result<Transaction, WalletError> {
    let nonce_sum = slate.public_nonce_sum()?;
    let blind_sum = slate.public_blind_sum()?;
    let msg = slate.kernel_msg();

    // Every partial present so far must verify against its contributor.
    for participant in &slate.participants {
        if let Some(part_sig) = &participant.part_sig {
            schnorr::verify_partial(
                part_sig,
                &participant.public_nonce,
                &participant.public_blind_excess,
                &nonce_sum,
                &blind_sum,
                &msg,
            )
            .map_err(|_| WalletError::PartialSignatureInvalid)?;
        }
    }
    slate
        .participant(1)?
        .part_sig
        .as_ref()
        .ok_or(WalletError::PartialSignatureInvalid)?;

    let sender_partial =
        schnorr::sign_partial(&ctx.sec_key, &ctx.sec_nonce, &nonce_sum, &blind_sum, &msg);
    let mut partials = vec![sender_partial];
    for participant in &slate.participants {
        if let Some(sig) = &participant.part_sig {
            partials.push(*sig);
        }
    }
    let excess_sig =
        schnorr::aggregate(&partials, &nonce_sum).map_err(|_| WalletError::KernelSignatureInvalid)?;

    // The aggregate must verify under the summed public excesses before we
    // ever emit a kernel.
    let excess = Commitment::from_bytes(*blind_sum.as_bytes());
    schnorr::verify(&excess_sig, &blind_sum, &msg)
        .map_err(|_| WalletError::KernelSignatureInvalid)?;

    let kernel = TxKernel {
        features: slate.kernel_features(),
        fee: slate.fee,
        lock_height: slate.lock_height,
        excess,
        excess_sig,
    };
    let body = TransactionBody::new(
        slate.tx.body.inputs.clone(),
        slate.tx.body.outputs.clone(),
        vec![kernel],
    )?;
    let tx = Transaction::new(slate.tx.offset.clone(), body);
    tx.validate()?;
    slate.tx = tx.clone();
    Ok(tx)
}

fn build_output_for(
    keychain: &Keychain,
    value: u64,
    blind: &BlindingFactor,
    key_index: u32,
) -> Result<Output, WalletError> {
    let commitment = commit(value, blind);
    let nonce = keychain.rewind_nonce(commitment.as_bytes());
    // Stash the derivation index in the proof message so restore can
    // rebuild the keychain path.
    let mut message = [0u8; PROOF_MESSAGE_LEN];
    message[..4].copy_from_slice(&key_index.to_be_bytes());
    let proof = rangeproof::prove(value, blind, &nonce, &message)?;
    Ok(Output {
        features: OutputFeatures::Plain,
        commitment,
        proof,
    })
}

/// Keep only outputs the node confirms as currently unspent, with their
/// recorded values intact. Run before coin selection so a slate never locks
/// funds the chain no longer recognizes.
pub fn confirm_outputs(
    node: &dyn super::NodeClient,
    outputs: &[OwnedOutput],
) -> Result<Vec<OwnedOutput>, WalletError> {
    let mut confirmed = vec![];
    for output in outputs {
        if node.get_unspent(&output.commitment)?.is_some() {
            confirmed.push(output.clone());
        }
    }
    Ok(confirmed)
}

/// Scan outputs for ones owned by this keychain by attempting rewinds.
/// Used by wallet restore.
pub fn recognize_output(
    keychain: &Keychain,
    output: &Output,
) -> Option<OwnedOutput> {
    let nonce = keychain.rewind_nonce(output.commitment.as_bytes());
    let rewound = rangeproof::rewind(&output.commitment, &output.proof, &nonce)?;
    let key_index = u32::from_be_bytes(rewound.message[..4].try_into().ok()?);
    Some(OwnedOutput {
        key_index,
        value: rewound.value,
        commitment: output.commitment,
    })
}
