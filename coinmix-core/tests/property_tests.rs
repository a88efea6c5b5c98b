// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{Keypair, Secp256k1};
use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid};
use coinmix_core::{Coin, ConstructionState, CoordinatorConfig};
use proptest::prelude::*;

fn script(seed: u8) -> ScriptBuf {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_seckey_slice(&secp, &[seed.max(1); 32]).unwrap();
    let (xonly, _) = keypair.x_only_public_key();
    if seed % 2 == 0 {
        ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly))
    } else {
        let pubkey = bitcoin::CompressedPublicKey(keypair.public_key());
        ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())
    }
}

fn coin(index: usize, sats: u64) -> Coin {
    let mut txid = [0u8; 32];
    txid[..8].copy_from_slice(&(index as u64).to_le_bytes());
    Coin::new(
        OutPoint {
            txid: Txid::from_byte_array(txid),
            vout: index as u32,
        },
        Amount::from_sat(sats),
        script(index as u8),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn construction_never_goes_negative(
        fee_rate in 1u64..50,
        inputs in prop::collection::vec(10_000u64..5_000_000, 1..8),
        outputs in prop::collection::vec(1_000u64..5_000_000, 0..12),
    ) {
        let mut state = ConstructionState::new(fee_rate);
        for (i, sats) in inputs.iter().enumerate() {
            let _ = state.add_input(coin(i, *sats));
            prop_assert!(state.balance().is_some());
        }
        for (i, sats) in outputs.iter().enumerate() {
            let before = state.outputs().len();
            let accepted = state
                .add_output(TxOut { value: Amount::from_sat(*sats), script_pubkey: script(100 + i as u8) })
                .is_ok();
            prop_assert!(state.balance().is_some());
            prop_assert_eq!(state.outputs().len(), before + usize::from(accepted));
        }
    }

    #[test]
    fn locking_preserves_inputs_and_outputs(
        fee_rate in 1u64..20,
        inputs in prop::collection::vec(50_000u64..2_000_000, 1..8),
        splits in prop::collection::vec(1u64..4, 1..8),
    ) {
        let mut state = ConstructionState::new(fee_rate);
        for (i, sats) in inputs.iter().enumerate() {
            state.add_input(coin(i, *sats)).unwrap();
        }

        let budget = state.balance().unwrap().to_sat() / (splits.len() as u64 * 4);
        for (i, part) in splits.iter().enumerate() {
            let value = (budget * part).max(1);
            let _ = state.add_output(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script(100 + i as u8),
            });
        }
        prop_assume!(!state.outputs().is_empty());

        let signing = state.finalize().unwrap();
        let tx = signing.unsigned_transaction();

        let mut locked_inputs: BTreeMap<OutPoint, TxOut> = BTreeMap::new();
        for (txin, prevout) in tx.input.iter().zip(signing.prevouts()) {
            locked_inputs.insert(txin.previous_output, prevout.clone());
        }
        let constructed: BTreeMap<OutPoint, TxOut> = state
            .inputs()
            .iter()
            .map(|c| (c.outpoint, c.txout.clone()))
            .collect();
        prop_assert_eq!(locked_inputs, constructed);

        let mut locked_outputs = tx.output.clone();
        let mut constructed_outputs = state.outputs().to_vec();
        locked_outputs.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.script_pubkey.cmp(&b.script_pubkey)));
        constructed_outputs.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.script_pubkey.cmp(&b.script_pubkey)));
        prop_assert_eq!(locked_outputs, constructed_outputs);

        prop_assert!(signing.prevouts().windows(2).all(|w| w[0].value >= w[1].value));
        prop_assert!(tx.output.windows(2).all(|w| w[0].value >= w[1].value));
        prop_assert_eq!(signing.signed_count(), 0);
    }

    #[test]
    fn min_input_count_within_bounds(max in 1usize..500, multiplier in 0.01f64..=1.0) {
        let config = CoordinatorConfig {
            max_input_count_per_round: max,
            min_input_count_multiplier: multiplier,
            ..Default::default()
        };
        let min = config.min_input_count();
        prop_assert!(min >= 1);
        prop_assert!(min <= max);
        prop_assert!(min as f64 >= (max as f64 * multiplier).floor());
    }
}
