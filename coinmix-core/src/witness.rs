// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::Signature as TaprootSignature;
use bitcoin::{CompressedPublicKey, ScriptBuf, Transaction, TxOut, Witness};

/// Check that `witness` spends input `index` of `tx` with a key-path
/// signature committing to every input and output.
pub(crate) fn verify_input_witness(
    tx: &Transaction,
    prevouts: &[TxOut],
    index: usize,
    witness: &Witness,
) -> Result<(), String> {
    let prevout = prevouts
        .get(index)
        .ok_or_else(|| format!("no previous output for input {index}"))?;

    if prevout.script_pubkey.is_p2tr() {
        verify_p2tr(tx, prevouts, index, witness)
    } else if prevout.script_pubkey.is_p2wpkh() {
        verify_p2wpkh(tx, prevout, index, witness)
    } else {
        Err("unsupported script type".into())
    }
}

fn verify_p2tr(
    tx: &Transaction,
    prevouts: &[TxOut],
    index: usize,
    witness: &Witness,
) -> Result<(), String> {
    if witness.len() != 1 {
        return Err(format!(
            "taproot key spend expects 1 witness element, got {}",
            witness.len()
        ));
    }
    let sig_bytes = witness.nth(0).ok_or("missing signature")?;
    let signature =
        TaprootSignature::from_slice(sig_bytes).map_err(|e| format!("bad signature: {e}"))?;

    if !matches!(
        signature.sighash_type,
        TapSighashType::Default | TapSighashType::All
    ) {
        return Err(format!(
            "sighash type {} does not commit to the whole transaction",
            signature.sighash_type
        ));
    }

    let program = &prevouts[index].script_pubkey.as_bytes()[2..];
    let output_key =
        XOnlyPublicKey::from_slice(program).map_err(|e| format!("bad output key: {e}"))?;

    let sighash = SighashCache::new(tx)
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), signature.sighash_type)
        .map_err(|e| format!("sighash: {e}"))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    Secp256k1::verification_only()
        .verify_schnorr(&signature.signature, &msg, &output_key)
        .map_err(|e| format!("signature does not verify: {e}"))
}

fn verify_p2wpkh(
    tx: &Transaction,
    prevout: &TxOut,
    index: usize,
    witness: &Witness,
) -> Result<(), String> {
    if witness.len() != 2 {
        return Err(format!(
            "p2wpkh spend expects 2 witness elements, got {}",
            witness.len()
        ));
    }
    let sig_bytes = witness.nth(0).ok_or("missing signature")?;
    let key_bytes = witness.nth(1).ok_or("missing public key")?;

    let signature =
        EcdsaSignature::from_slice(sig_bytes).map_err(|e| format!("bad signature: {e}"))?;
    if signature.sighash_type != EcdsaSighashType::All {
        return Err(format!(
            "sighash type {} does not commit to the whole transaction",
            signature.sighash_type
        ));
    }

    let pubkey =
        CompressedPublicKey::from_slice(key_bytes).map_err(|e| format!("bad public key: {e}"))?;
    if ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()) != prevout.script_pubkey {
        return Err("public key does not match the spent output".into());
    }

    let sighash = SighashCache::new(tx)
        .p2wpkh_signature_hash(
            index,
            &prevout.script_pubkey,
            prevout.value,
            EcdsaSighashType::All,
        )
        .map_err(|e| format!("sighash: {e}"))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    Secp256k1::verification_only()
        .verify_ecdsa(&msg, &signature.signature, &pubkey.0)
        .map_err(|e| format!("signature does not verify: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::key::TweakedPublicKey;
    use bitcoin::secp256k1::{Keypair, SecretKey};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, Txid};

    fn skeleton(inputs: usize) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: (0..inputs)
                .map(|i| TxIn {
                    previous_output: OutPoint {
                        txid: Txid::from_byte_array([i as u8 + 1; 32]),
                        vout: 0,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: ScriptBuf::new_p2wpkh(&test_p2wpkh_key(9).1.wpubkey_hash()),
            }],
        }
    }

    fn test_p2tr_key(seed: u8) -> (Keypair, ScriptBuf) {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
        let (xonly, _) = keypair.x_only_public_key();
        let script = ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly));
        (keypair, script)
    }

    fn test_p2wpkh_key(seed: u8) -> (SecretKey, CompressedPublicKey) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
        let pubkey = CompressedPublicKey(secret.public_key(&secp));
        (secret, pubkey)
    }

    fn sign_p2tr(tx: &Transaction, prevouts: &[TxOut], index: usize, keypair: &Keypair) -> Witness {
        let sighash = SighashCache::new(tx)
            .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), TapSighashType::Default)
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = Secp256k1::new().sign_schnorr_no_aux_rand(&msg, keypair);
        Witness::p2tr_key_spend(&TaprootSignature {
            signature,
            sighash_type: TapSighashType::Default,
        })
    }

    #[test]
    fn test_p2tr_witness_verifies() {
        let tx = skeleton(2);
        let (kp1, spk1) = test_p2tr_key(1);
        let (_, spk2) = test_p2tr_key(2);
        let prevouts = vec![
            TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: spk1,
            },
            TxOut {
                value: Amount::from_sat(60_000),
                script_pubkey: spk2,
            },
        ];

        let witness = sign_p2tr(&tx, &prevouts, 0, &kp1);
        assert!(verify_input_witness(&tx, &prevouts, 0, &witness).is_ok());
        assert!(verify_input_witness(&tx, &prevouts, 1, &witness).is_err());
    }

    #[test]
    fn test_p2tr_witness_for_other_transaction_rejected() {
        let tx = skeleton(1);
        let (kp, spk) = test_p2tr_key(1);
        let prevouts = vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: spk,
        }];
        let witness = sign_p2tr(&tx, &prevouts, 0, &kp);

        let mut other = tx.clone();
        other.output[0].value = Amount::from_sat(9_000);
        assert!(verify_input_witness(&other, &prevouts, 0, &witness).is_err());
    }

    #[test]
    fn test_p2wpkh_witness_verifies() {
        let tx = skeleton(1);
        let (secret, pubkey) = test_p2wpkh_key(3);
        let prevouts = vec![TxOut {
            value: Amount::from_sat(70_000),
            script_pubkey: ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()),
        }];

        let sighash = SighashCache::new(&tx)
            .p2wpkh_signature_hash(
                0,
                &prevouts[0].script_pubkey,
                prevouts[0].value,
                EcdsaSighashType::All,
            )
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = EcdsaSignature::sighash_all(Secp256k1::new().sign_ecdsa(&msg, &secret));
        let witness = Witness::p2wpkh(&signature, &pubkey.0);

        assert!(verify_input_witness(&tx, &prevouts, 0, &witness).is_ok());

        let (_, other_key) = test_p2wpkh_key(4);
        let forged = Witness::p2wpkh(&signature, &other_key.0);
        assert!(verify_input_witness(&tx, &prevouts, 0, &forged).is_err());
    }

    #[test]
    fn test_malformed_witness_rejected() {
        let tx = skeleton(1);
        let (_, spk) = test_p2tr_key(1);
        let prevouts = vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: spk,
        }];
        assert!(verify_input_witness(&tx, &prevouts, 0, &Witness::default()).is_err());
        let garbage = Witness::from_slice(&[vec![0u8; 64]]);
        assert!(verify_input_witness(&tx, &prevouts, 0, &garbage).is_err());
    }
}
