use std::str::FromStr;

use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    eips::Encodable2718,
    network::TxSigner,
    primitives::{Address, Bytes, TxKind, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolCall,
    transports::TransportError,
};
use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::units::base_units_string;
use super::{ChainKind, Denomination, Fee, LedgerBackend, SignedPayload, TransferRequest};
use crate::error::{LedgerError, LedgerResult};
use crate::fees::{clamp_gas_price, FeeHint};

sol! {
    function transfer(address to, uint256 amount) external returns (bool);
}

/// Node responses meaning the exact same signed transaction is already in the pool.
const ALREADY_KNOWN_MARKERS: &[&str] = &["already known", "known transaction"];

#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// ERC-20 contract to pay out from; native transfers when unset.
    pub token_contract: Option<Address>,
    pub gas_limit: u64,
    /// Lower bound applied to the network gas price (wei)
    pub min_gas_price_wei: Decimal,
    /// Gas price used until a fee hint arrives (wei)
    pub default_gas_price_wei: Decimal,
    pub decimals: u32,
}

/// EVM ledger backend: legacy transactions signed locally, sent as raw RLP.
pub struct EvmBackend {
    provider: DynProvider,
    signer: PrivateKeySigner,
    sender: String,
    config: EvmConfig,
    denomination: Denomination,
    fee_hint: FeeHint,
}

impl EvmBackend {
    pub async fn connect(
        config: EvmConfig,
        private_key: &str,
        expected_address: Option<&str>,
        fee_hint: FeeHint,
    ) -> LedgerResult<Self> {
        let signer = private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| LedgerError::Signing {
                chain: ChainKind::Evm,
                message: format!("invalid private key: {}", e),
            })?;

        let sender = signer.address().to_checksum(None);
        if let Some(expected) = expected_address {
            if !expected.eq_ignore_ascii_case(&sender) {
                return Err(LedgerError::Signing {
                    chain: ChainKind::Evm,
                    message: format!("private key does not belong to {}", expected),
                });
            }
        }

        let provider = ProviderBuilder::new()
            .connect(&config.rpc_url)
            .await
            .map_err(transport)?
            .erased();

        let denomination = Denomination::new("wei", "token", config.decimals);

        info!(
            "✅ EVM backend ready: sender={} chain_id={} token={:?}",
            sender, config.chain_id, config.token_contract
        );

        Ok(Self {
            provider,
            signer,
            sender,
            config,
            denomination,
            fee_hint,
        })
    }

    fn parse_address(&self, address: &str) -> LedgerResult<Address> {
        Address::from_str(address).map_err(|_| LedgerError::InvalidAddress {
            chain: ChainKind::Evm,
            address: address.to_string(),
        })
    }

    /// (to, value, input) for a payout of `amount` base units to `recipient`.
    fn call_for(&self, recipient: Address, amount: U256) -> (Address, U256, Bytes) {
        match self.config.token_contract {
            Some(contract) => {
                let input = transferCall {
                    to: recipient,
                    amount,
                }
                .abi_encode();
                (contract, U256::ZERO, input.into())
            }
            None => (recipient, amount, Bytes::new()),
        }
    }
}

pub fn is_evm_address(address: &str) -> bool {
    address.starts_with("0x") && address.len() == 42 && Address::from_str(address).is_ok()
}

fn transport(error: TransportError) -> LedgerError {
    LedgerError::Transport {
        chain: ChainKind::Evm,
        message: error.to_string(),
    }
}

/// Split node errors into rejections (the node answered) and transport failures.
fn classify(error: TransportError) -> LedgerError {
    match error.as_error_resp() {
        Some(payload) => LedgerError::BroadcastRejected {
            chain: ChainKind::Evm,
            reason: payload.message.to_string(),
        },
        None => transport(error),
    }
}

fn is_already_known(error: &LedgerError) -> bool {
    match error {
        LedgerError::BroadcastRejected { reason, .. } => {
            let reason = reason.to_lowercase();
            ALREADY_KNOWN_MARKERS.iter().any(|m| reason.contains(m))
        }
        _ => false,
    }
}

fn to_u256(amount: Decimal) -> LedgerResult<U256> {
    let digits = base_units_string(amount)?;
    U256::from_str_radix(&digits, 10).map_err(|e| LedgerError::Units(e.to_string()))
}

#[async_trait]
impl LedgerBackend for EvmBackend {
    fn chain(&self) -> ChainKind {
        ChainKind::Evm
    }

    fn sender_address(&self) -> &str {
        &self.sender
    }

    fn is_address_of_this_kind(&self, address: &str) -> bool {
        is_evm_address(address)
    }

    fn denomination(&self) -> &Denomination {
        &self.denomination
    }

    async fn resolve_fee(&self) -> LedgerResult<Fee> {
        let network = self.provider.get_gas_price().await.map_err(transport)?;
        let network = Decimal::from_u128(network)
            .ok_or_else(|| LedgerError::Units(format!("network gas price {} out of range", network)))?;
        let gas_price = clamp_gas_price(
            self.fee_hint.current(),
            network,
            self.config.min_gas_price_wei,
            self.config.default_gas_price_wei,
        );

        debug!("⛽ Gas price: network={} chosen={}", network, gas_price);

        Ok(Fee {
            gas_limit: self.config.gas_limit,
            gas_price,
        })
    }

    async fn sign(&self, transfer: &TransferRequest) -> LedgerResult<SignedPayload> {
        let recipient = self.parse_address(&transfer.recipient)?;
        let amount = to_u256(transfer.amount)?;
        let gas_price = transfer
            .fee
            .gas_price
            .trunc()
            .to_u128()
            .ok_or_else(|| LedgerError::Units(format!("gas price {} out of range", transfer.fee.gas_price)))?;

        let (to, value, input) = self.call_for(recipient, amount);
        let mut tx = TxLegacy {
            chain_id: Some(self.config.chain_id),
            nonce: transfer.sequence,
            gas_price,
            gas_limit: transfer.fee.gas_limit,
            to: TxKind::Call(to),
            value,
            input,
        };

        let signature = self
            .signer
            .sign_transaction(&mut tx)
            .await
            .map_err(|e| LedgerError::Signing {
                chain: ChainKind::Evm,
                message: e.to_string(),
            })?;

        let signed = tx.into_signed(signature);
        let hash = signed.hash().to_string();
        let raw = format!("0x{}", hex::encode(TxEnvelope::Legacy(signed).encoded_2718()));

        Ok(SignedPayload {
            raw,
            hash: Some(hash),
        })
    }

    async fn broadcast(&self, payload: &SignedPayload) -> LedgerResult<String> {
        let bytes = hex::decode(payload.raw.trim_start_matches("0x")).map_err(|e| LedgerError::Signing {
            chain: ChainKind::Evm,
            message: format!("raw transaction is not hex: {}", e),
        })?;

        match self.provider.send_raw_transaction(&bytes).await {
            Ok(pending) => Ok(pending.tx_hash().to_string()),
            Err(e) => {
                let error = classify(e);
                match (&payload.hash, is_already_known(&error)) {
                    (Some(hash), true) => {
                        warn!("Transaction {} already known to the node, treating as sent", hash);
                        Ok(hash.clone())
                    }
                    _ => Err(error),
                }
            }
        }
    }

    async fn current_account_sequence(&self, address: &str) -> LedgerResult<u64> {
        let address = self.parse_address(address)?;
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(transport)
    }

    async fn current_height(&self) -> LedgerResult<u64> {
        self.provider.get_block_number().await.map_err(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_evm_address_detection() {
        assert!(is_evm_address("0x8ba1f109551bD432803012645Ac136ddd64DBA72"));
        assert!(!is_evm_address("8ba1f109551bD432803012645Ac136ddd64DBA72"));
        assert!(!is_evm_address("0x8ba1f109551bD432803012645Ac136ddd64DBA7"));
        assert!(!is_evm_address("cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu"));
    }

    #[test]
    fn test_already_known_counts_as_sent() {
        let known = LedgerError::BroadcastRejected {
            chain: ChainKind::Evm,
            reason: "already known".to_string(),
        };
        let other = LedgerError::BroadcastRejected {
            chain: ChainKind::Evm,
            reason: "insufficient funds".to_string(),
        };

        assert!(is_already_known(&known));
        assert!(!is_already_known(&other));
    }

    #[test]
    fn test_amount_to_u256() {
        assert_eq!(
            to_u256(dec!(3000000000000000000)).unwrap(),
            U256::from(3_000_000_000_000_000_000u128)
        );
        assert!(to_u256(dec!(0.5)).is_err());
    }

    #[test]
    fn test_erc20_transfer_encoding() {
        let to = Address::from_str("0x8ba1f109551bD432803012645Ac136ddd64DBA72").unwrap();
        let input = transferCall {
            to,
            amount: U256::from(5u64),
        }
        .abi_encode();

        // selector of transfer(address,uint256)
        assert_eq!(&input[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(input.len(), 4 + 32 * 2);
    }
}
