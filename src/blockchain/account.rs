use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::HashMap;

use super::crypto::Address;
use super::transaction::{BalanceEffect, Transaction, TransactionError};

/// Errors that can occur during account operations
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Represents an account in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// The account's address
    pub address: Address,

    /// The account's balance
    pub balance: u64,

    /// Number of transactions (mined and pending) this account sent or received
    pub transaction_count: u64,
}

impl Account {
    /// Creates a new account with a zero balance
    pub fn new(address: Address) -> Self {
        Account {
            address,
            balance: 0,
            transaction_count: 0,
        }
    }

    /// Increases the account's balance
    pub fn deposit(&mut self, amount: u64) -> Result<(), AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| {
                AccountError::InvalidAmount(format!("Balance overflow adding {}", amount))
            })?;
        Ok(())
    }

    /// Decreases the account's balance
    pub fn withdraw(&mut self, amount: u64) -> Result<(), AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        if self.balance < amount {
            return Err(AccountError::InsufficientFunds {
                required: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;
        Ok(())
    }

    /// Checks if the account has sufficient funds
    pub fn has_sufficient_funds(&self, amount: u64) -> bool {
        self.balance >= amount
    }
}

/// Balances of every address the ledger has seen.
///
/// Only mutated through [`BalanceEffect`]s, either while executing a
/// transaction or while rolling one back.
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    accounts: HashMap<Address, Account>,
}

impl AccountState {
    /// Gets an account by address
    pub fn get_account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    #[cfg(test)]
    pub fn balance(&self, address: &Address) -> Option<u64> {
        self.accounts.get(address).map(|account| account.balance)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// Validates a transaction against current balances and applies it.
    ///
    /// On success the transaction is marked executed. On failure the state
    /// is left untouched.
    pub fn execute(&mut self, transaction: &mut Transaction) -> Result<(), TransactionError> {
        let sender_account = transaction
            .sender
            .address()
            .and_then(|address| self.accounts.get(address));

        transaction.validate(sender_account)?;
        self.apply(&transaction.effect())?;
        transaction.executed = true;

        Ok(())
    }

    /// Applies a balance effect atomically
    pub fn apply(&mut self, effect: &BalanceEffect) -> Result<(), AccountError> {
        let mut recipient = self
            .accounts
            .get(&effect.credit)
            .cloned()
            .unwrap_or_else(|| Account::new(effect.credit.clone()));

        match &effect.debit {
            // Self-transfer: must be funded, net balance unchanged
            Some(sender) if *sender == effect.credit => {
                recipient.withdraw(effect.amount)?;
                recipient.deposit(effect.amount)?;
            }
            Some(sender) => {
                let mut sender = self
                    .accounts
                    .get(sender)
                    .cloned()
                    .ok_or_else(|| AccountError::AccountNotFound(sender.to_string()))?;
                sender.withdraw(effect.amount)?;
                recipient.deposit(effect.amount)?;
                sender.transaction_count += 1;
                self.accounts.insert(sender.address.clone(), sender);
            }
            None => recipient.deposit(effect.amount)?,
        }

        recipient.transaction_count += 1;
        self.accounts.insert(recipient.address.clone(), recipient);

        Ok(())
    }

    /// Undoes a previously applied balance effect.
    ///
    /// An account whose only reference was the reverted transaction is removed.
    pub fn revert(&mut self, effect: &BalanceEffect) -> Result<(), AccountError> {
        let mut recipient = self
            .accounts
            .get(&effect.credit)
            .cloned()
            .ok_or_else(|| AccountError::AccountNotFound(effect.credit.to_string()))?;

        match &effect.debit {
            Some(sender) if *sender == effect.credit => {}
            Some(sender) => {
                let mut sender = self
                    .accounts
                    .get(sender)
                    .cloned()
                    .ok_or_else(|| AccountError::AccountNotFound(sender.to_string()))?;
                recipient.withdraw(effect.amount)?;
                sender.deposit(effect.amount)?;
                sender.transaction_count = sender.transaction_count.saturating_sub(1);
                self.accounts.insert(sender.address.clone(), sender);
            }
            None => recipient.withdraw(effect.amount)?,
        }

        recipient.transaction_count = recipient.transaction_count.saturating_sub(1);
        if recipient.transaction_count == 0 && recipient.balance == 0 {
            self.accounts.remove(&recipient.address);
        } else {
            self.accounts.insert(recipient.address.clone(), recipient);
        }

        Ok(())
    }

    /// Gets all accounts
    pub fn get_all_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        accounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;

    fn address(name: &str) -> Address {
        Address(name.to_string())
    }

    #[test]
    fn test_account_creation() {
        let account = Account::new(address("test_address"));

        assert_eq!(account.address, address("test_address"));
        assert_eq!(account.balance, 0);
        assert_eq!(account.transaction_count, 0);
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut account = Account::new(address("test_address"));

        account.deposit(100).unwrap();
        assert_eq!(account.balance, 100);

        account.withdraw(50).unwrap();
        assert_eq!(account.balance, 50);

        // Insufficient funds
        assert!(account.withdraw(100).is_err());
        assert!(account.deposit(0).is_err());
    }

    #[test]
    fn test_apply_mint_and_transfer() {
        let mut state = AccountState::default();
        let miner = address("miner");
        let friend = address("friend");

        state
            .apply(&BalanceEffect { debit: None, credit: miner.clone(), amount: 3 })
            .unwrap();
        state
            .apply(&BalanceEffect { debit: Some(miner.clone()), credit: friend.clone(), amount: 2 })
            .unwrap();

        assert_eq!(state.balance(&miner), Some(1));
        assert_eq!(state.balance(&friend), Some(2));
        assert_eq!(state.get_account(&miner).unwrap().transaction_count, 2);
        assert_eq!(state.get_account(&friend).unwrap().transaction_count, 1);
    }

    #[test]
    fn test_apply_overdraft_leaves_state_untouched() {
        let mut state = AccountState::default();
        let miner = address("miner");
        let friend = address("friend");

        state
            .apply(&BalanceEffect { debit: None, credit: miner.clone(), amount: 5 })
            .unwrap();
        let result = state.apply(&BalanceEffect {
            debit: Some(miner.clone()),
            credit: friend.clone(),
            amount: 6,
        });

        assert!(matches!(result, Err(AccountError::InsufficientFunds { .. })));
        assert_eq!(state.balance(&miner), Some(5));
        assert!(!state.contains(&friend));
    }

    #[test]
    fn test_self_transfer_counts_once() {
        let mut state = AccountState::default();
        let miner = address("miner");

        state
            .apply(&BalanceEffect { debit: None, credit: miner.clone(), amount: 2 })
            .unwrap();
        let effect = BalanceEffect { debit: Some(miner.clone()), credit: miner.clone(), amount: 2 };
        state.apply(&effect).unwrap();

        assert_eq!(state.balance(&miner), Some(2));
        assert_eq!(state.get_account(&miner).unwrap().transaction_count, 2);

        state.revert(&effect).unwrap();
        assert_eq!(state.balance(&miner), Some(2));
        assert_eq!(state.get_account(&miner).unwrap().transaction_count, 1);
    }

    #[test]
    fn test_revert_removes_fresh_account() {
        let mut state = AccountState::default();
        let miner = address("miner");
        let effect = BalanceEffect { debit: None, credit: miner.clone(), amount: 1 };

        state.apply(&effect).unwrap();
        state.revert(&effect).unwrap();

        assert!(!state.contains(&miner));
        assert!(state.get_all_accounts().is_empty());
    }

    #[test]
    fn test_execute_marks_transaction() {
        let mut state = AccountState::default();
        let wallet = Wallet::new();
        let recipient = Wallet::new().address().clone();

        let mut reward = Transaction::new_coinbase(wallet.address().clone(), 5);
        state.execute(&mut reward).unwrap();
        assert!(reward.executed);

        let mut transfer = Transaction::new(wallet.address().clone(), recipient.clone(), 2, None);
        transfer.sign(&wallet, 1).unwrap();
        state.execute(&mut transfer).unwrap();

        assert!(transfer.executed);
        assert_eq!(state.balance(wallet.address()), Some(3));
        assert_eq!(state.balance(&recipient), Some(2));

        // Replaying the same signature at a later position fails
        let mut replayed = transfer.clone();
        replayed.executed = false;
        assert!(matches!(
            state.execute(&mut replayed),
            Err(TransactionError::InvalidSignature)
        ));
        assert!(!replayed.executed);
    }
}
