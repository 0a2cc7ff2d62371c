//! # Crypto Collaborator
//!
//! The wallet never touches key material directly; it asks a [`CryptoApi`]
//! for keypairs, hashes, signatures and the blind/unblind steps of
//! withdrawal. The protocol-level constructions built on top of those
//! primitives (pre-coins, deposit permissions, refresh sessions) live in
//! this module as free functions so that every implementation of the
//! primitives gets them for free.
//!
//! ## LocalCrypto
//!
//! The bundled implementation signs with Ed25519 (`ed25519-dalek`) and
//! hashes with BLAKE3. Denomination keys are Ed25519 keys too, and blinding
//! is *transparent*: the envelope is a keyed hash of the coin's public key,
//! the exchange signs the envelope, and "unblinding" bundles the blinding
//! key with that signature so anyone can recheck it. That keeps the
//! withdraw, melt and reveal message flow intact without pretending to give
//! unlinkability.
//!
//! ```text
//!   coin_ev   = BLAKE3("coffer-blind" ‖ coin_pub ‖ blinding_key ‖ denom_pub)
//!   ev_sig    = Sign(denom_priv, coin_ev)                (exchange side)
//!   denom_sig = blinding_key ‖ ev_sig                    (unblind)
//! ```
//!
//! All keys, signatures and hashes cross the trait boundary as lowercase
//! hex strings.

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::amounts::Amount;
use crate::error::{CryptoError, WalletError, WalletResult};
use crate::records::{
    CoinPaySig, CoinRecord, CoinStatus, Contract, DenominationRecord, PreCoinRecord, RefreshPlanchet,
    RefreshSessionRecord, ReserveRecord,
};

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Hex-encoded Ed25519 keypair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: String,
    pub private: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait CryptoApi: Send + Sync {
    async fn create_keypair(&self) -> CryptoResult<KeyPair>;

    /// Deterministic keypair from a 32-byte seed.
    async fn keypair_from_seed(&self, seed: [u8; 32]) -> CryptoResult<KeyPair>;

    /// 32 fresh random bytes, hex-encoded.
    async fn random_secret(&self) -> String;

    async fn hash(&self, data: &[u8]) -> String;

    async fn sign(&self, private: &str, message: &[u8]) -> CryptoResult<String>;

    async fn verify(&self, public: &str, message: &[u8], signature: &str) -> CryptoResult<bool>;

    /// Envelope for `coin_pub` under `denom_pub`.
    async fn blind(&self, coin_pub: &str, blinding_key: &str, denom_pub: &str) -> CryptoResult<String>;

    /// Turn the exchange's signature over an envelope into a coin signature.
    async fn unblind(&self, ev_sig: &str, blinding_key: &str, denom_pub: &str) -> CryptoResult<String>;

    /// Check a coin signature produced by [`CryptoApi::unblind`].
    async fn verify_denom_sig(&self, coin_pub: &str, denom_sig: &str, denom_pub: &str) -> CryptoResult<bool>;
}

// ---------------------------------------------------------------------------
// Signed Messages
// ---------------------------------------------------------------------------

/// What the exchange master key signs for each denomination.
pub fn denomination_message(d: &DenominationRecord) -> Vec<u8> {
    format!(
        "coffer-denom|{}|{}|{}|{}|{}|{}|{}|{}",
        d.denom_pub,
        d.value,
        d.fee_withdraw,
        d.fee_deposit,
        d.fee_refresh,
        d.stamp_start.timestamp(),
        d.stamp_expire_withdraw.timestamp(),
        d.stamp_expire_deposit.timestamp(),
    )
    .into_bytes()
}

/// What a reserve key signs to request one coin.
pub fn withdraw_message(reserve_pub: &str, denom_pub: &str, coin_ev: &str, cost: &Amount) -> Vec<u8> {
    format!("coffer-withdraw|{}|{}|{}|{}", reserve_pub, denom_pub, coin_ev, cost).into_bytes()
}

/// What a coin key signs to pay `contribution` towards a contract.
pub fn deposit_message(contract_hash: &str, coin_pub: &str, contribution: &Amount, merchant_pub: &str) -> Vec<u8> {
    format!(
        "coffer-deposit|{}|{}|{}|{}",
        contract_hash, coin_pub, contribution, merchant_pub
    )
    .into_bytes()
}

/// What a coin key signs to melt `value_with_fee` into a refresh session.
pub fn melt_message(session_hash: &str, coin_pub: &str, value_with_fee: &Amount) -> Vec<u8> {
    format!("coffer-melt|{}|{}|{}", session_hash, coin_pub, value_with_fee).into_bytes()
}

fn decode32(hex_str: &str, what: &str) -> CryptoResult<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{} must be 32 bytes", what)))
}

/// Seed of candidate coin `index` derived from a transfer key. Anyone who
/// learns the transfer private key can recompute the candidate, which is
/// what lets the exchange check the revealed sets.
pub fn refresh_seed(transfer_priv: &str, old_coin_pub: &str, index: usize) -> CryptoResult<[u8; 32]> {
    let transfer = decode32(transfer_priv, "transfer key")?;
    let coin = decode32(old_coin_pub, "coin public key")?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"coffer-refresh");
    hasher.update(&transfer);
    hasher.update(&coin);
    hasher.update(&(index as u64).to_le_bytes());
    Ok(*hasher.finalize().as_bytes())
}

// ---------------------------------------------------------------------------
// Protocol Constructions
// ---------------------------------------------------------------------------

/// Fresh coin keys, blinded envelope and the reserve's withdraw signature.
pub async fn create_pre_coin(
    crypto: &dyn CryptoApi,
    denom: &DenominationRecord,
    reserve: &ReserveRecord,
) -> WalletResult<PreCoinRecord> {
    let coin = crypto.create_keypair().await?;
    let blinding_key = crypto.random_secret().await;
    let coin_ev = crypto.blind(&coin.public, &blinding_key, &denom.denom_pub).await?;
    let cost = denom.withdraw_cost()?;
    let withdraw_sig = crypto
        .sign(
            &reserve.reserve_priv,
            &withdraw_message(&reserve.reserve_pub, &denom.denom_pub, &coin_ev, &cost),
        )
        .await?;
    Ok(PreCoinRecord {
        coin_pub: coin.public,
        coin_priv: coin.private,
        reserve_pub: reserve.reserve_pub.clone(),
        exchange_base_url: reserve.exchange_base_url.clone(),
        denom_pub: denom.denom_pub.clone(),
        blinding_key,
        withdraw_sig,
        coin_ev,
        coin_value: denom.value.clone(),
        cost,
    })
}

/// A coin together with its denomination.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinWithDenom {
    pub coin: CoinRecord,
    pub denom: DenominationRecord,
}

/// Deposit permissions for `coins`, spending them in order until the
/// contract amount (plus whatever deposit fees exceed `max_fee`) is covered.
/// Returns the permissions and the coins with their reduced amounts.
pub async fn sign_deposit(
    crypto: &dyn CryptoApi,
    contract: &Contract,
    contract_hash: &str,
    coins: &[CoinWithDenom],
) -> WalletResult<Vec<(CoinPaySig, CoinRecord)>> {
    let currency = contract.amount.currency();
    let fees = Amount::zero(currency)
        .sum(coins.iter().map(|c| &c.denom.fee_deposit))?
        .amount;
    // Fees beyond what the merchant covers are paid by the customer.
    let excess_fee = fees.sub(&contract.max_fee)?.amount;
    let mut remaining = contract
        .amount
        .add(&excess_fee)?
        .checked()
        .ok_or_else(|| WalletError::Saturated("adding deposit fees".into()))?;

    let mut out = Vec::with_capacity(coins.len());
    for cd in coins {
        if remaining.is_zero() {
            break;
        }
        let current = &cd.coin.current_amount;
        let contribution = if remaining.checked_cmp(current)?.is_lt() {
            remaining.clone()
        } else {
            current.clone()
        };
        remaining = remaining.sub(&contribution)?.amount;

        let coin_sig = crypto
            .sign(
                &cd.coin.coin_priv,
                &deposit_message(contract_hash, &cd.coin.coin_pub, &contribution, &contract.merchant_pub),
            )
            .await?;
        let mut updated = cd.coin.clone();
        updated.current_amount = current.sub(&contribution)?.amount;
        updated.status = if updated.current_amount.is_zero() {
            CoinStatus::Dormant
        } else {
            CoinStatus::Dirty
        };
        out.push((
            CoinPaySig {
                coin_pub: cd.coin.coin_pub.clone(),
                denom_pub: cd.coin.denom_pub.clone(),
                denom_sig: cd.coin.denom_sig.clone(),
                contribution,
                coin_sig,
            },
            updated,
        ));
    }
    if !remaining.is_zero() {
        return Err(WalletError::CoinsInsufficient);
    }
    Ok(out)
}

/// Commitment over a refresh session's public parts.
pub async fn refresh_session_hash(
    crypto: &dyn CryptoApi,
    melt_coin_pub: &str,
    value_with_fee: &Amount,
    transfer_pubs: &[String],
    new_denoms: &[String],
    planchets: &[Vec<RefreshPlanchet>],
) -> String {
    let mut preimage = String::from("coffer-refresh-session");
    for part in transfer_pubs.iter().chain(new_denoms) {
        preimage.push('|');
        preimage.push_str(part);
    }
    preimage.push('|');
    preimage.push_str(melt_coin_pub);
    preimage.push('|');
    preimage.push_str(&value_with_fee.to_string());
    for planchet in planchets.iter().flatten() {
        preimage.push('|');
        preimage.push_str(&planchet.coin_ev);
    }
    crypto.hash(preimage.as_bytes()).await
}

/// Candidate coins for one transfer key.
pub async fn derive_refresh_planchets(
    crypto: &dyn CryptoApi,
    transfer_priv: &str,
    old_coin_pub: &str,
    new_denoms: &[String],
) -> CryptoResult<Vec<RefreshPlanchet>> {
    let mut planchets = Vec::with_capacity(new_denoms.len());
    for (index, denom_pub) in new_denoms.iter().enumerate() {
        let seed = refresh_seed(transfer_priv, old_coin_pub, index)?;
        let coin = crypto.keypair_from_seed(seed).await?;
        let blinding_key = hex::encode(blake3::keyed_hash(&seed, b"coffer-refresh-blind").as_bytes());
        let coin_ev = crypto.blind(&coin.public, &blinding_key, denom_pub).await?;
        planchets.push(RefreshPlanchet {
            coin_pub: coin.public,
            coin_priv: coin.private,
            blinding_key,
            coin_ev,
        });
    }
    Ok(planchets)
}

/// Build an unmelted refresh session moving `melt_coin`'s value into
/// coins of `new_denoms`.
pub async fn create_refresh_session(
    crypto: &dyn CryptoApi,
    exchange_base_url: &str,
    kappa: usize,
    melt_coin: &CoinRecord,
    new_denoms: &[DenominationRecord],
    melt_fee: &Amount,
) -> WalletResult<RefreshSessionRecord> {
    let mut value_with_fee = melt_fee.clone();
    for d in new_denoms {
        value_with_fee = value_with_fee
            .add(&d.withdraw_cost()?)?
            .checked()
            .ok_or_else(|| WalletError::Saturated("pricing a refresh".into()))?;
    }

    let denom_pubs: Vec<String> = new_denoms.iter().map(|d| d.denom_pub.clone()).collect();
    let mut transfer_pubs = Vec::with_capacity(kappa);
    let mut transfer_privs = Vec::with_capacity(kappa);
    let mut planchets = Vec::with_capacity(kappa);
    for _ in 0..kappa {
        let transfer = crypto.create_keypair().await?;
        planchets.push(
            derive_refresh_planchets(crypto, &transfer.private, &melt_coin.coin_pub, &denom_pubs).await?,
        );
        transfer_pubs.push(transfer.public);
        transfer_privs.push(transfer.private);
    }

    let session_hash = refresh_session_hash(
        crypto,
        &melt_coin.coin_pub,
        &value_with_fee,
        &transfer_pubs,
        &denom_pubs,
        &planchets,
    )
    .await;
    let confirm_sig = crypto
        .sign(
            &melt_coin.coin_priv,
            &melt_message(&session_hash, &melt_coin.coin_pub, &value_with_fee),
        )
        .await?;

    Ok(RefreshSessionRecord {
        session_id: uuid::Uuid::new_v4().to_string(),
        exchange_base_url: exchange_base_url.to_string(),
        melt_coin_pub: melt_coin.coin_pub.clone(),
        value_with_fee,
        session_hash,
        confirm_sig,
        transfer_pubs,
        transfer_privs,
        new_denoms: denom_pubs,
        planchets,
        noreveal_index: None,
        finished: false,
        created: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// LocalCrypto
// ---------------------------------------------------------------------------

/// Ed25519 + BLAKE3 implementation of [`CryptoApi`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCrypto;

impl LocalCrypto {
    pub fn new() -> Self {
        Self
    }

    fn signing_key(private: &str) -> CryptoResult<SigningKey> {
        Ok(SigningKey::from_bytes(&decode32(private, "private key")?))
    }

    fn verifying_key(public: &str) -> CryptoResult<VerifyingKey> {
        VerifyingKey::from_bytes(&decode32(public, "public key")?)
            .map_err(|_| CryptoError::InvalidKey("not an Ed25519 point".into()))
    }

    fn signature(sig: &str) -> CryptoResult<Signature> {
        let bytes: [u8; 64] = hex::decode(sig)?
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature("signatures are 64 bytes".into()))?;
        Ok(Signature::from_bytes(&bytes))
    }

    fn keypair(signing_key: &SigningKey) -> KeyPair {
        KeyPair {
            public: hex::encode(signing_key.verifying_key().to_bytes()),
            private: hex::encode(signing_key.to_bytes()),
        }
    }

    fn envelope(coin_pub: &str, blinding_key: &str, denom_pub: &str) -> CryptoResult<[u8; 32]> {
        let coin = decode32(coin_pub, "coin public key")?;
        let blinding = decode32(blinding_key, "blinding key")?;
        let denom = decode32(denom_pub, "denomination key")?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"coffer-blind");
        hasher.update(&coin);
        hasher.update(&blinding);
        hasher.update(&denom);
        Ok(*hasher.finalize().as_bytes())
    }
}

#[async_trait]
impl CryptoApi for LocalCrypto {
    async fn create_keypair(&self) -> CryptoResult<KeyPair> {
        Ok(Self::keypair(&SigningKey::generate(&mut OsRng)))
    }

    async fn keypair_from_seed(&self, seed: [u8; 32]) -> CryptoResult<KeyPair> {
        Ok(Self::keypair(&SigningKey::from_bytes(&seed)))
    }

    async fn random_secret(&self) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    async fn hash(&self, data: &[u8]) -> String {
        hex::encode(blake3::hash(data).as_bytes())
    }

    async fn sign(&self, private: &str, message: &[u8]) -> CryptoResult<String> {
        let key = Self::signing_key(private)?;
        Ok(hex::encode(key.sign(message).to_bytes()))
    }

    async fn verify(&self, public: &str, message: &[u8], signature: &str) -> CryptoResult<bool> {
        let key = Self::verifying_key(public)?;
        let signature = Self::signature(signature)?;
        Ok(key.verify(message, &signature).is_ok())
    }

    async fn blind(&self, coin_pub: &str, blinding_key: &str, denom_pub: &str) -> CryptoResult<String> {
        Ok(hex::encode(Self::envelope(coin_pub, blinding_key, denom_pub)?))
    }

    async fn unblind(&self, ev_sig: &str, blinding_key: &str, denom_pub: &str) -> CryptoResult<String> {
        Self::verifying_key(denom_pub)?;
        Self::signature(ev_sig)?;
        decode32(blinding_key, "blinding key")?;
        Ok(format!("{}{}", blinding_key, ev_sig))
    }

    async fn verify_denom_sig(&self, coin_pub: &str, denom_sig: &str, denom_pub: &str) -> CryptoResult<bool> {
        if denom_sig.len() != 64 + 128 || !denom_sig.is_ascii() {
            return Err(CryptoError::InvalidSignature("malformed coin signature".into()));
        }
        let (blinding_key, ev_sig) = denom_sig.split_at(64);
        let envelope = Self::envelope(coin_pub, blinding_key, denom_pub)?;
        let key = Self::verifying_key(denom_pub)?;
        Ok(key.verify(&envelope, &Self::signature(ev_sig)?).is_ok())
    }
}
