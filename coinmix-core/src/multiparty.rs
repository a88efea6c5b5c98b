// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::alice::Coin;
use crate::error::{CoordinatorError, Result};
use crate::witness::verify_input_witness;

pub const P2WPKH_INPUT_VSIZE: u64 = 68;
pub const P2TR_INPUT_VSIZE: u64 = 58;
pub const P2WPKH_OUTPUT_VSIZE: u64 = 31;
pub const P2TR_OUTPUT_VSIZE: u64 = 43;

/// Virtual size of spending `script`, `None` for unsupported script types.
pub fn input_vsize(script: &Script) -> Option<u64> {
    if script.is_p2tr() {
        Some(P2TR_INPUT_VSIZE)
    } else if script.is_p2wpkh() {
        Some(P2WPKH_INPUT_VSIZE)
    } else {
        None
    }
}

pub fn output_vsize(script: &Script) -> Option<u64> {
    if script.is_p2tr() {
        Some(P2TR_OUTPUT_VSIZE)
    } else if script.is_p2wpkh() {
        Some(P2WPKH_OUTPUT_VSIZE)
    } else {
        None
    }
}

fn script_not_allowed(script: &Script) -> CoordinatorError {
    CoordinatorError::ScriptNotAllowed(script.to_hex_string())
}

#[derive(Debug, Clone)]
pub enum CoinjoinState {
    Construction(ConstructionState),
    Signing(SigningState),
}

impl CoinjoinState {
    pub fn as_construction(&self) -> Option<&ConstructionState> {
        match self {
            Self::Construction(state) => Some(state),
            Self::Signing(_) => None,
        }
    }

    pub fn as_signing(&self) -> Option<&SigningState> {
        match self {
            Self::Signing(state) => Some(state),
            Self::Construction(_) => None,
        }
    }
}

/// Inputs and outputs accumulated before the transaction shape is fixed.
///
/// Every mutation keeps `sum(inputs) >= sum(outputs) + required_fee()`.
#[derive(Debug, Clone)]
pub struct ConstructionState {
    fee_rate: u64,
    inputs: Vec<Coin>,
    outputs: Vec<TxOut>,
}

impl ConstructionState {
    pub fn new(fee_rate: u64) -> Self {
        Self {
            fee_rate,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn inputs(&self) -> &[Coin] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    pub fn input_fee(&self, script: &Script) -> Result<Amount> {
        let vsize = input_vsize(script).ok_or_else(|| script_not_allowed(script))?;
        Ok(Amount::from_sat(vsize.saturating_mul(self.fee_rate)))
    }

    pub fn output_fee(&self, script: &Script) -> Result<Amount> {
        let vsize = output_vsize(script).ok_or_else(|| script_not_allowed(script))?;
        Ok(Amount::from_sat(vsize.saturating_mul(self.fee_rate)))
    }

    pub fn estimated_vsize(&self) -> u64 {
        let inputs: u64 = self
            .inputs
            .iter()
            .filter_map(|c| input_vsize(c.script_pubkey()))
            .sum();
        let outputs: u64 = self
            .outputs
            .iter()
            .filter_map(|o| output_vsize(&o.script_pubkey))
            .sum();
        inputs + outputs
    }

    pub fn required_fee(&self) -> Amount {
        Amount::from_sat(self.estimated_vsize().saturating_mul(self.fee_rate))
    }

    pub fn total_input(&self) -> Amount {
        self.inputs.iter().map(Coin::value).sum()
    }

    pub fn total_output(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Surplus over outputs and fee; `None` when the invariant is broken.
    pub fn balance(&self) -> Option<Amount> {
        self.total_input()
            .checked_sub(self.total_output())?
            .checked_sub(self.required_fee())
    }

    fn ensure_balanced(candidate: &Self) -> Result<()> {
        if candidate.balance().is_some() {
            return Ok(());
        }
        let needed = candidate.total_output() + candidate.required_fee();
        Err(CoordinatorError::InsufficientFunds {
            missing: needed
                .checked_sub(candidate.total_input())
                .unwrap_or(Amount::ZERO),
        })
    }

    pub fn contains_input(&self, outpoint: &OutPoint) -> bool {
        self.inputs.iter().any(|c| &c.outpoint == outpoint)
    }

    pub fn add_input(&mut self, coin: Coin) -> Result<()> {
        if self.contains_input(&coin.outpoint) {
            return Err(CoordinatorError::AlreadyRegistered(coin.outpoint));
        }
        self.input_fee(coin.script_pubkey())?;

        let mut candidate = self.clone();
        candidate.inputs.push(coin);
        Self::ensure_balanced(&candidate)?;

        *self = candidate;
        Ok(())
    }

    pub fn remove_input(&mut self, outpoint: &OutPoint) -> Result<()> {
        let Some(position) = self.inputs.iter().position(|c| &c.outpoint == outpoint) else {
            return Err(CoordinatorError::Transaction(format!(
                "input {outpoint} not in construction"
            )));
        };

        let mut candidate = self.clone();
        candidate.inputs.remove(position);
        Self::ensure_balanced(&candidate)?;

        *self = candidate;
        Ok(())
    }

    pub fn add_output(&mut self, output: TxOut) -> Result<()> {
        self.output_fee(&output.script_pubkey)?;

        let mut candidate = self.clone();
        candidate.outputs.push(output);
        Self::ensure_balanced(&candidate)?;

        *self = candidate;
        Ok(())
    }

    /// Fix the transaction shape. Inputs are ordered by value descending then
    /// outpoint, outputs by value descending then script.
    pub fn finalize(&self) -> Result<SigningState> {
        if self.inputs.is_empty() {
            return Err(CoordinatorError::Transaction("no inputs to lock".into()));
        }
        if self.outputs.is_empty() {
            return Err(CoordinatorError::Transaction("no outputs to lock".into()));
        }
        Self::ensure_balanced(self)
            .map_err(|e| CoordinatorError::Transaction(format!("unbalanced construction: {e}")))?;

        let mut inputs = self.inputs.clone();
        inputs.sort_by(|a, b| {
            b.value()
                .cmp(&a.value())
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });

        let mut outputs = self.outputs.clone();
        outputs.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
        });

        let transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|coin| TxIn {
                    previous_output: coin.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs,
        };
        let prevouts = inputs.into_iter().map(|coin| coin.txout).collect();

        Ok(SigningState::new(transaction, prevouts))
    }
}

/// Locked transaction skeleton. Only witnesses can be attached.
#[derive(Debug, Clone)]
pub struct SigningState {
    transaction: Transaction,
    prevouts: Vec<TxOut>,
    witnesses: Vec<Option<Witness>>,
}

impl SigningState {
    fn new(transaction: Transaction, prevouts: Vec<TxOut>) -> Self {
        let witnesses = vec![None; transaction.input.len()];
        Self {
            transaction,
            prevouts,
            witnesses,
        }
    }

    /// The skeleton participants sign. Witnesses are always empty here.
    pub fn unsigned_transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn prevouts(&self) -> &[TxOut] {
        &self.prevouts
    }

    pub fn input_index(&self, outpoint: &OutPoint) -> Option<usize> {
        self.transaction
            .input
            .iter()
            .position(|txin| &txin.previous_output == outpoint)
    }

    pub fn is_input_signed(&self, index: usize) -> bool {
        matches!(self.witnesses.get(index), Some(Some(_)))
    }

    /// Verify and attach `witness` for input `index`. A second call for an
    /// already signed input is a no-op.
    pub fn add_witness(&mut self, index: usize, witness: Witness) -> Result<()> {
        if index >= self.witnesses.len() {
            return Err(CoordinatorError::InvalidWitness(format!(
                "input index {index} out of range"
            )));
        }
        if self.is_input_signed(index) {
            return Ok(());
        }

        verify_input_witness(&self.transaction, &self.prevouts, index, &witness)
            .map_err(CoordinatorError::InvalidWitness)?;

        self.witnesses[index] = Some(witness);
        Ok(())
    }

    pub fn signed_count(&self) -> usize {
        self.witnesses.iter().filter(|w| w.is_some()).count()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.witnesses.iter().all(Option::is_some)
    }

    pub fn signed_outpoints(&self) -> Vec<OutPoint> {
        self.outpoints_where(true)
    }

    pub fn unsigned_outpoints(&self) -> Vec<OutPoint> {
        self.outpoints_where(false)
    }

    fn outpoints_where(&self, signed: bool) -> Vec<OutPoint> {
        self.transaction
            .input
            .iter()
            .zip(&self.witnesses)
            .filter(|(_, w)| w.is_some() == signed)
            .map(|(txin, _)| txin.previous_output)
            .collect()
    }

    /// The fully witnessed transaction, ready for broadcast.
    pub fn create_transaction(&self) -> Result<Transaction> {
        let mut transaction = self.transaction.clone();
        for (index, (txin, witness)) in transaction
            .input
            .iter_mut()
            .zip(&self.witnesses)
            .enumerate()
        {
            let Some(witness) = witness else {
                return Err(CoordinatorError::Transaction(format!(
                    "input {index} has no witness"
                )));
            };
            txin.witness = witness.clone();
        }
        Ok(transaction)
    }
}
