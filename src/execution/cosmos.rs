use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bech32::{Bech32, Hrp};
use reqwest::Client;
use ripemd::Ripemd160;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::units::base_units_string;
use super::{ChainKind, Denomination, Fee, LedgerBackend, SignedPayload, TransferRequest};
use crate::error::{LedgerError, LedgerResult};
use rust_decimal::Decimal;

const MAX_MEMO_CHARS: usize = 256;
const PUBKEY_TYPE: &str = "tendermint/PubKeySecp256k1";

#[derive(Debug, Clone)]
pub struct CosmosConfig {
    /// LCD REST base url, e.g. `http://localhost:1317`
    pub lcd_endpoint: String,
    pub chain_id: String,
    /// Expected sender. Derived from the key when `None`; rejected if it differs.
    pub sender_address: Option<String>,
    pub gas: u64,
    pub denom: String,
    pub display_denom: String,
    pub decimals: u32,
    pub address_prefix: String,
    pub request_timeout: Duration,
}

/// Cosmos SDK ledger backend speaking amino JSON to the legacy LCD endpoints
pub struct CosmosBackend {
    http: Client,
    secp: Secp256k1<secp256k1::All>,
    secret_key: SecretKey,
    public_key: [u8; 33],
    sender_address: String,
    config: CosmosConfig,
    denomination: Denomination,
    account_number: OnceCell<String>,
}

impl CosmosBackend {
    pub fn new(config: CosmosConfig, private_key_hex: &str) -> LedgerResult<Self> {
        let key_bytes = hex::decode(private_key_hex.trim_start_matches("0x")).map_err(|e| signing(e.to_string()))?;
        let secret_key = SecretKey::from_slice(&key_bytes).map_err(|e| signing(e.to_string()))?;

        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key).serialize();

        let sender_address = derive_address(&config.address_prefix, &public_key)?;
        if let Some(configured) = config.sender_address.as_deref() {
            if configured != sender_address {
                return Err(signing(format!(
                    "configured sender {} does not belong to the signing key ({})",
                    configured, sender_address
                )));
            }
        }

        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| transport(e.to_string()))?;

        let denomination = Denomination::new(&config.denom, &config.display_denom, config.decimals);

        info!(
            "✅ Cosmos backend ready: sender={} chain_id={} denom={}",
            sender_address, config.chain_id, config.denom
        );

        Ok(Self {
            http,
            secp,
            secret_key,
            public_key,
            sender_address,
            config,
            denomination,
            account_number: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.lcd_endpoint.trim_end_matches('/'), path)
    }

    async fn get_json(&self, path: &str) -> LedgerResult<Value> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transport(format!("GET {} returned {}", path, status)));
        }

        response.json().await.map_err(|e| transport(e.to_string()))
    }

    async fn account_info(&self) -> LedgerResult<AccountInfo> {
        let body = self
            .get_json(&format!("/auth/accounts/{}", self.sender_address))
            .await?;
        parse_account(&body).ok_or_else(|| transport("unexpected account response shape".to_string()))
    }

    /// Account numbers never change once assigned.
    async fn account_number(&self) -> LedgerResult<String> {
        self.account_number
            .get_or_try_init(|| async { self.account_info().await.map(|a| a.account_number) })
            .await
            .cloned()
    }

    /// Build the signed amino `StdTx` for `transfer`.
    fn build_signed_tx(&self, transfer: &TransferRequest, account_number: &str) -> LedgerResult<Value> {
        let amount = base_units_string(transfer.amount)?;
        let memo: String = transfer
            .memo
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(MAX_MEMO_CHARS)
            .collect();
        let sequence = transfer.sequence.to_string();
        let gas = transfer.fee.gas_limit.to_string();

        let msg = json!({
            "type": "cosmos-sdk/MsgSend",
            "value": {
                "from_address": self.sender_address,
                "to_address": transfer.recipient,
                "amount": [{ "denom": self.config.denom, "amount": amount }],
            },
        });
        let fee = json!({ "amount": [], "gas": gas });

        let sign_doc = json!({
            "account_number": account_number,
            "chain_id": self.config.chain_id,
            "fee": fee,
            "memo": memo,
            "msgs": [msg.clone()],
            "sequence": sequence,
        });

        let digest = Sha256::digest(canonical_json(&sign_doc).as_bytes());
        let message = Message::from_digest_slice(&digest).map_err(|e| signing(e.to_string()))?;
        let signature = self.secp.sign_ecdsa(&message, &self.secret_key).serialize_compact();

        Ok(json!({
            "msg": [msg],
            "fee": fee,
            "memo": memo,
            "signatures": [{
                "signature": BASE64.encode(signature),
                "account_number": account_number,
                "sequence": sequence,
                "pub_key": {
                    "type": PUBKEY_TYPE,
                    "value": BASE64.encode(self.public_key),
                },
            }],
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountInfo {
    account_number: String,
    sequence: u64,
}

fn signing(message: String) -> LedgerError {
    LedgerError::Signing {
        chain: ChainKind::Cosmos,
        message,
    }
}

fn transport(message: String) -> LedgerError {
    LedgerError::Transport {
        chain: ChainKind::Cosmos,
        message,
    }
}

/// Bech32 account address of a compressed secp256k1 key: `ripemd160(sha256(key))`.
pub fn derive_address(prefix: &str, public_key: &[u8; 33]) -> LedgerResult<String> {
    let hrp = Hrp::parse(prefix).map_err(|e| signing(format!("address prefix {:?}: {}", prefix, e)))?;
    let account = Ripemd160::digest(Sha256::digest(public_key));
    bech32::encode::<Bech32>(hrp, &account).map_err(|e| signing(e.to_string()))
}

/// JSON with object keys sorted at every level and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// LCD numbers come back either as strings or as JSON numbers.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn parse_account(body: &Value) -> Option<AccountInfo> {
    let value = body.pointer("/result/value").or_else(|| body.get("value"))?;
    let account_number = match value.get("account_number")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    // Fresh accounts omit the sequence.
    let sequence = value.get("sequence").map_or(Some(0), as_u64)?;

    Some(AccountInfo {
        account_number,
        sequence,
    })
}

fn parse_height(body: &Value) -> Option<u64> {
    body.pointer("/block/header/height")
        .or_else(|| body.pointer("/block_meta/header/height"))
        .and_then(as_u64)
}

fn parse_broadcast(body: &Value) -> LedgerResult<String> {
    let code = body.get("code").and_then(Value::as_u64).unwrap_or(0);
    if code != 0 {
        let reason = body
            .get("raw_log")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(LedgerError::BroadcastRejected {
            chain: ChainKind::Cosmos,
            reason,
        });
    }

    body.get("txhash")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| transport("broadcast response carries no txhash".to_string()))
}

#[async_trait]
impl LedgerBackend for CosmosBackend {
    fn chain(&self) -> ChainKind {
        ChainKind::Cosmos
    }

    fn sender_address(&self) -> &str {
        &self.sender_address
    }

    fn is_address_of_this_kind(&self, address: &str) -> bool {
        match bech32::decode(address) {
            Ok((hrp, data)) => {
                hrp.as_str().eq_ignore_ascii_case(&self.config.address_prefix) && matches!(data.len(), 20 | 32)
            }
            Err(_) => false,
        }
    }

    fn denomination(&self) -> &Denomination {
        &self.denomination
    }

    async fn resolve_fee(&self) -> LedgerResult<Fee> {
        Ok(Fee {
            gas_limit: self.config.gas,
            gas_price: Decimal::ZERO,
        })
    }

    async fn sign(&self, transfer: &TransferRequest) -> LedgerResult<SignedPayload> {
        let account_number = self.account_number().await?;
        let tx = self.build_signed_tx(transfer, &account_number)?;

        Ok(SignedPayload {
            raw: tx.to_string(),
            hash: None,
        })
    }

    async fn broadcast(&self, payload: &SignedPayload) -> LedgerResult<String> {
        let tx: Value = serde_json::from_str(&payload.raw).map_err(|e| signing(e.to_string()))?;

        let response = self
            .http
            .post(self.url("/txs"))
            .json(&json!({ "tx": tx, "mode": "sync" }))
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport(e.to_string()))?;

        if status.is_server_error() {
            return Err(transport(format!("POST /txs returned {}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(LedgerError::BroadcastRejected {
                chain: ChainKind::Cosmos,
                reason: body,
            });
        }

        let body: Value = serde_json::from_str(&body).map_err(|e| transport(e.to_string()))?;
        let hash = parse_broadcast(&body)?;
        debug!("📡 Cosmos broadcast accepted: {}", hash);
        Ok(hash)
    }

    async fn current_account_sequence(&self, address: &str) -> LedgerResult<u64> {
        if address != self.sender_address {
            return Err(LedgerError::InvalidAddress {
                chain: ChainKind::Cosmos,
                address: address.to_string(),
            });
        }
        Ok(self.account_info().await?.sequence)
    }

    async fn current_height(&self) -> LedgerResult<u64> {
        let body = self.get_json("/blocks/latest").await?;
        parse_height(&body).ok_or_else(|| transport("unexpected block response shape".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use secp256k1::ecdsa::Signature;

    const KEY: &str = "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100";

    fn config(sender_address: Option<&str>) -> CosmosConfig {
        CosmosConfig {
            lcd_endpoint: "http://localhost:1317".to_string(),
            chain_id: "likecoin-test".to_string(),
            sender_address: sender_address.map(str::to_string),
            gas: 200_000,
            denom: "nanolike".to_string(),
            display_denom: "LIKE".to_string(),
            decimals: 9,
            address_prefix: "cosmos".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn backend() -> CosmosBackend {
        CosmosBackend::new(config(None), KEY).unwrap()
    }

    fn address(prefix: &str, payload: &[u8]) -> String {
        bech32::encode::<Bech32>(Hrp::parse(prefix).unwrap(), payload).unwrap()
    }

    fn transfer(memo: Option<String>) -> TransferRequest {
        TransferRequest {
            recipient: "cosmos1recipient".to_string(),
            amount: dec!(1500000000),
            sequence: 7,
            fee: Fee {
                gas_limit: 200_000,
                gas_price: Decimal::ZERO,
            },
            memo,
        }
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({ "b": 1, "a": { "d": [ { "z": 0, "y": "x" } ], "c": null } });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"d":[{"y":"x","z":0}]},"b":1}"#
        );
    }

    #[test]
    fn test_signed_tx_shape_and_signature() {
        let backend = backend();
        let tx = backend.build_signed_tx(&transfer(Some("p1; p2".to_string())), "12").unwrap();

        assert_eq!(tx["msg"][0]["value"]["amount"][0]["amount"], "1500000000");
        assert_eq!(tx["msg"][0]["value"]["amount"][0]["denom"], "nanolike");
        assert_eq!(tx["memo"], "p1; p2");
        assert_eq!(tx["signatures"][0]["sequence"], "7");
        assert_eq!(tx["signatures"][0]["account_number"], "12");
        assert_eq!(tx["signatures"][0]["pub_key"]["type"], PUBKEY_TYPE);

        // Recompute the sign doc and verify the signature against it.
        let sign_doc = json!({
            "account_number": "12",
            "chain_id": "likecoin-test",
            "fee": tx["fee"],
            "memo": "p1; p2",
            "msgs": tx["msg"],
            "sequence": "7",
        });
        let digest = Sha256::digest(canonical_json(&sign_doc).as_bytes());
        let message = Message::from_digest_slice(&digest).unwrap();
        let raw_sig = BASE64
            .decode(tx["signatures"][0]["signature"].as_str().unwrap())
            .unwrap();
        let signature = Signature::from_compact(&raw_sig).unwrap();
        let public_key = PublicKey::from_slice(&backend.public_key).unwrap();

        assert!(backend.secp.verify_ecdsa(&message, &signature, &public_key).is_ok());
    }

    #[test]
    fn test_memo_is_truncated() {
        let tx = backend()
            .build_signed_tx(&transfer(Some("x".repeat(400))), "12")
            .unwrap();
        assert_eq!(tx["memo"].as_str().unwrap().len(), MAX_MEMO_CHARS);
    }

    #[test]
    fn test_sender_is_derived_from_the_key() {
        let backend = backend();

        let (hrp, payload) = bech32::decode(backend.sender_address()).unwrap();
        assert_eq!(hrp.as_str(), "cosmos");
        assert_eq!(payload, Ripemd160::digest(Sha256::digest(backend.public_key)).to_vec());
        assert!(backend.is_address_of_this_kind(backend.sender_address()));

        let configured = backend.sender_address().to_string();
        let same = CosmosBackend::new(config(Some(&configured)), KEY).unwrap();
        assert_eq!(same.sender_address(), configured);
    }

    #[test]
    fn test_sender_for_another_key_is_rejected() {
        let other = address("cosmos", &[7u8; 20]);
        let result = CosmosBackend::new(config(Some(&other)), KEY);
        assert!(matches!(result, Err(LedgerError::Signing { .. })));
    }

    #[test]
    fn test_address_detection() {
        let backend = backend();
        let payload: Vec<u8> = (1..=20).collect();
        let valid = address("cosmos", &payload);

        assert!(backend.is_address_of_this_kind(&valid));
        assert!(backend.is_address_of_this_kind(&valid.to_uppercase()));
        assert!(backend.is_address_of_this_kind(&address("cosmos", &[9u8; 32])));
        assert!(!backend.is_address_of_this_kind(&address("osmo", &payload)));
        assert!(!backend.is_address_of_this_kind(&address("cosmos", &payload[..8])));
        assert!(!backend.is_address_of_this_kind("cosmos1sender"));
        assert!(!backend.is_address_of_this_kind("0x8ba1f109551bD432803012645Ac136ddd64DBA72"));

        // One flipped character breaks the checksum.
        let mut corrupted = valid.clone().into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'q' { b'p' } else { b'q' };
        assert!(!backend.is_address_of_this_kind(&String::from_utf8(corrupted).unwrap()));
    }

    #[test]
    fn test_parse_account_shapes() {
        let legacy = json!({ "value": { "account_number": "12", "sequence": "40" } });
        let wrapped = json!({ "height": "5", "result": { "value": { "account_number": 12, "sequence": 41 } } });
        let fresh = json!({ "value": { "account_number": "3" } });

        assert_eq!(parse_account(&legacy).unwrap().sequence, 40);
        assert_eq!(parse_account(&wrapped).unwrap().account_number, "12");
        assert_eq!(parse_account(&fresh).unwrap().sequence, 0);
        assert!(parse_account(&json!({})).is_none());
    }

    #[test]
    fn test_parse_height() {
        assert_eq!(parse_height(&json!({ "block": { "header": { "height": "1234" } } })), Some(1234));
        assert_eq!(parse_height(&json!({ "block_meta": { "header": { "height": 99 } } })), Some(99));
    }

    #[test]
    fn test_parse_broadcast() {
        assert_eq!(
            parse_broadcast(&json!({ "txhash": "ABCD", "code": 0 })).unwrap(),
            "ABCD"
        );

        let err = parse_broadcast(&json!({
            "txhash": "ABCD",
            "code": 4,
            "raw_log": "signature verification failed; account sequence mismatch, expected 42, got 40"
        }))
        .unwrap_err();
        assert!(err.is_stale_sequence());
    }
}
