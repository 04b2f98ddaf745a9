use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;

use super::account::{Account, AccountError};
use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, Wallet};

/// Sender identity used for protocol-minted coins
pub const COINBASE_SENDER: &str = "0";

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Unknown sender address: {0}")]
    UnknownSender(String),

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Invalid recipient address: {0}")]
    InvalidRecipientAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Transaction not signed")]
    MissingSignature,

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),
}

/// The originator of a transfer: either a real account or the coinbase sentinel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Sender {
    Coinbase,
    Account(Address),
}

impl Sender {
    /// Resolves a raw identity string, mapping `"0"` to the coinbase sentinel
    pub fn parse(identity: &str) -> Self {
        if identity == COINBASE_SENDER {
            Sender::Coinbase
        } else {
            Sender::Account(Address(identity.to_string()))
        }
    }

    pub fn address(&self) -> Option<&Address> {
        match self {
            Sender::Coinbase => None,
            Sender::Account(address) => Some(address),
        }
    }
}

impl From<String> for Sender {
    fn from(identity: String) -> Self {
        if identity == COINBASE_SENDER {
            Sender::Coinbase
        } else {
            Sender::Account(Address(identity))
        }
    }
}

impl From<Sender> for String {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::Coinbase => COINBASE_SENDER.to_string(),
            Sender::Account(address) => address.0,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::Coinbase => write!(f, "{}", COINBASE_SENDER),
            Sender::Account(address) => write!(f, "{}", address),
        }
    }
}

/// The balance change a transaction causes once executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEffect {
    /// Account debited, `None` for coinbase minting
    pub debit: Option<Address>,

    /// Account credited
    pub credit: Address,

    /// Amount moved
    pub amount: u64,
}

/// Builds the exact message a sender signs for a transfer.
///
/// `prior_transactions` is the number of transactions the sender took part in
/// before this one. Clients must format it identically, an absent message is
/// rendered as an empty string.
pub fn signing_message(
    sender: &Address,
    recipient: &Address,
    message: Option<&str>,
    amount: u64,
    prior_transactions: u64,
) -> String {
    format!(
        "{} {} {} {} {}",
        sender,
        recipient,
        message.unwrap_or(""),
        amount,
        prior_transactions
    )
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Sender's address, or "0" for a mining reward
    #[schema(value_type = String, example = "0")]
    pub sender: Sender,

    /// Recipient's address
    pub recipient: Address,

    /// Amount being transferred
    pub amount: u64,

    /// Optional free-form note
    #[serde(default)]
    pub message: Option<String>,

    /// Digital signature of the transaction
    #[serde(default)]
    pub signature: Option<DigitalSignature>,

    /// Set once the balance effect has been applied
    #[serde(skip)]
    pub executed: bool,
}

impl Transaction {
    /// Creates a new unsigned transfer
    ///
    /// # Arguments
    ///
    /// * `sender` - The address of the sender
    /// * `recipient` - The address of the recipient
    /// * `amount` - The amount to transfer
    /// * `message` - An optional note carried with the transfer
    pub fn new(sender: Address, recipient: Address, amount: u64, message: Option<String>) -> Self {
        Transaction {
            sender: Sender::Account(sender),
            recipient,
            amount,
            message,
            signature: None,
            executed: false,
        }
    }

    /// Creates a new coinbase transaction (mining reward)
    pub fn new_coinbase(recipient: Address, amount: u64) -> Self {
        Transaction {
            sender: Sender::Coinbase,
            recipient,
            amount,
            message: None,
            signature: None,
            executed: false,
        }
    }

    /// Signs the transaction with a wallet
    ///
    /// # Arguments
    ///
    /// * `wallet` - The wallet to sign with
    /// * `prior_transactions` - The sender's transaction count at signing time
    pub fn sign(
        &mut self,
        wallet: &Wallet,
        prior_transactions: u64,
    ) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        let sender = match &self.sender {
            Sender::Account(address) => address,
            Sender::Coinbase => {
                return Err(TransactionError::InvalidSenderAddress(
                    "Coinbase transactions are not signed".to_string(),
                ))
            }
        };

        if wallet.address() != sender {
            return Err(TransactionError::InvalidSenderAddress(
                "Wallet address does not match sender address".to_string(),
            ));
        }

        let message = self.signing_message(sender, prior_transactions);
        self.signature = Some(wallet.sign(message.as_bytes()));

        Ok(())
    }

    /// Verifies the transaction's signature against the sender's public key
    pub fn verify_signature(&self, prior_transactions: u64) -> Result<bool, TransactionError> {
        let sender = match &self.sender {
            Sender::Coinbase => return Ok(true),
            Sender::Account(address) => address,
        };

        let signature = self
            .signature
            .as_ref()
            .ok_or(TransactionError::MissingSignature)?;

        let public_key = sender.to_public_key()?;
        let message = self.signing_message(sender, prior_transactions);

        verify_signature(message.as_bytes(), signature, &public_key).map_err(TransactionError::from)
    }

    fn signing_message(&self, sender: &Address, prior_transactions: u64) -> String {
        signing_message(
            sender,
            &self.recipient,
            self.message.as_deref(),
            self.amount,
            prior_transactions,
        )
    }

    /// Checks the transaction against the sender's current account.
    ///
    /// `sender_account` is `None` when the sender has no account; that is only
    /// acceptable for coinbase transactions.
    pub fn validate(&self, sender_account: Option<&Account>) -> Result<(), TransactionError> {
        let account = match (&self.sender, sender_account) {
            (Sender::Coinbase, _) => None,
            (Sender::Account(_), Some(account)) => Some(account),
            (Sender::Account(address), None) => {
                return Err(TransactionError::UnknownSender(address.to_string()))
            }
        };

        if self.amount == 0 {
            return Err(TransactionError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        if let Some(account) = account {
            if !account.has_sufficient_funds(self.amount) {
                return Err(TransactionError::InsufficientFunds {
                    required: self.amount,
                    available: account.balance,
                });
            }

            match self.verify_signature(account.transaction_count) {
                Ok(true) => {}
                Ok(false) | Err(TransactionError::CryptoError(_)) => {
                    return Err(TransactionError::InvalidSignature)
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Whether the address sent or received this transaction
    pub fn involves(&self, address: &Address) -> bool {
        self.sender.address() == Some(address) || &self.recipient == address
    }

    pub fn effect(&self) -> BalanceEffect {
        BalanceEffect {
            debit: self.sender.address().cloned(),
            credit: self.recipient.clone(),
            amount: self.amount,
        }
    }
}
